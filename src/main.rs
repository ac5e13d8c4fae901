//! InkLedger - handwriting recognition for ledger entry
//!
//! Command-line front end: recognize a saved drawing, manage models,
//! consent and stored telemetry.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use inkledger::capture::{CanvasSize, Stroke, StrokePoint};
use inkledger::config::{self, AppConfig};
use inkledger::storage::{self, ConsentScope, SessionCredential};
use inkledger::vision::models::{ModelManager, ModelType};
use inkledger::vision::RecognitionMode;
use inkledger::InkPipeline;

/// Environment variable holding the session PIN
const PIN_ENV: &str = "INKLEDGER_PIN";

/// InkLedger - on-device handwriting recognition
#[derive(Parser, Debug)]
#[command(name = "inkledger")]
#[command(about = "Turn handwritten strokes into confidence-scored text")]
struct Args {
    /// Configuration file (defaults to config.toml in the config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recognize a drawing saved as JSON
    Recognize {
        /// File with `canvas` and `strokes` (arrays of points)
        #[arg(long)]
        strokes: PathBuf,

        /// auto, text, digit or backend
        #[arg(long)]
        mode: Option<RecognitionMode>,

        /// Confirm the result with this text (records a correction when it differs)
        #[arg(long)]
        accept: Option<String>,
    },
    /// Show model status
    Models {
        /// Download missing models
        #[arg(long)]
        download: bool,
    },
    /// Manage storage consent
    Consent {
        #[command(subcommand)]
        action: ConsentAction,
    },
    /// Delete telemetry older than the retention window
    PruneTelemetry,
}

#[derive(Subcommand, Debug)]
enum ConsentAction {
    /// Accept storage for the given scopes
    Grant {
        #[arg(long = "scope", default_value = "ocr")]
        scopes: Vec<ConsentScope>,

        /// Expire the grant after this many days
        #[arg(long)]
        ttl_days: Option<u64>,
    },
    /// Withdraw consent
    Revoke,
    /// Print the current consent record
    Status,
}

/// Drawing file read by `recognize`
#[derive(Debug, Deserialize)]
struct Drawing {
    canvas: CanvasSize,
    strokes: Vec<Vec<StrokePoint>>,
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let config = load_or_create_config(args.config.as_deref());

    match args.command {
        Command::Recognize { strokes, mode, accept } => run_recognize(config, &strokes, mode, accept),
        Command::Models { download } => run_models(&config, download),
        Command::Consent { action } => run_consent(config, action),
        Command::PruneTelemetry => {
            let pipeline = InkPipeline::open(config)?;
            let pruned = pipeline.prune_telemetry()?;
            println!("Pruned {} telemetry records", pruned);
            Ok(())
        }
    }
}

/// Load configuration from file or create default
fn load_or_create_config(explicit: Option<&Path>) -> AppConfig {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => storage::get_config_dir().ok().map(|dir| dir.join("config.toml")),
    };

    if let Some(path) = path.filter(|p| p.exists()) {
        match config::load_config(&path) {
            Ok(config) => {
                info!("Loaded configuration from {:?}", path);
                return config;
            }
            Err(e) => tracing::warn!("Ignoring unreadable config {:?}: {:#}", path, e),
        }
    }
    info!("Using default configuration");
    AppConfig::default()
}

fn session_credential() -> Result<SessionCredential> {
    let pin = std::env::var(PIN_ENV).with_context(|| format!("Set {} to the session PIN", PIN_ENV))?;
    Ok(SessionCredential::new(pin)?)
}

fn run_recognize(config: AppConfig, path: &Path, mode: Option<RecognitionMode>, accept: Option<String>) -> Result<()> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let drawing: Drawing = serde_json::from_str(&content).context("Invalid drawing file")?;
    let canvas = drawing.canvas;
    let strokes: Vec<Stroke> = drawing.strokes.into_iter().map(Stroke::new).collect();

    let credential = accept.as_ref().map(|_| session_credential()).transpose()?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(async move {
        let pipeline = InkPipeline::open(config)?;
        if let Some(credential) = &credential {
            pipeline.unlock(credential)?;
        }

        let mut options = pipeline.default_options();
        if let Some(mode) = mode {
            options.mode = mode;
        }

        let result = pipeline.recognize_strokes(&strokes, canvas, options).await;
        let recognition = match result {
            Ok(recognition) => recognition,
            Err(e) => {
                pipeline.shutdown().await;
                return Err(e.into());
            }
        };

        for token in &recognition.tokens {
            println!(
                "{}\t{:.2}\t{:?}{}",
                token.text,
                token.confidence,
                token.source_engine,
                token.bias.map(|b| format!("\t{:?}", b)).unwrap_or_default()
            );
        }

        if let (Some(accepted), Some(credential)) = (accept, credential) {
            let outcome = pipeline.confirm(&recognition, &accepted, &credential)?;
            if outcome.telemetry_saved {
                println!("Saved (correction recorded: {})", outcome.correction_saved);
            } else {
                println!("Not saved: OCR consent not granted");
            }
        }

        pipeline.shutdown().await;
        Ok::<_, anyhow::Error>(())
    })
}

fn run_models(config: &AppConfig, download: bool) -> Result<()> {
    let settings = &config.recognition;
    let manager = match &settings.model_dir {
        Some(dir) => ModelManager::with_dir(dir.clone(), download)?,
        None => ModelManager::new(download)?,
    };

    if download {
        for model_type in ModelType::ALL {
            if manager.is_model_available(model_type) {
                continue;
            }
            manager.download_model_with_progress(
                model_type,
                Some(Box::new(move |done, total| {
                    if let Some(total) = total.filter(|t| *t > 0) {
                        eprint!("\r{}: {}%", model_type.display_name(), done * 100 / total);
                    }
                })),
            )?;
            eprintln!();
        }
    }

    println!("Models in {:?}", manager.models_dir());
    for (model_type, available, size) in manager.get_model_status() {
        println!(
            "  {:<24} {:<10} {}",
            model_type.display_name(),
            if available { "ready" } else { "missing" },
            size.map(|s| format!("{} bytes", s)).unwrap_or_default()
        );
    }
    Ok(())
}

fn run_consent(config: AppConfig, action: ConsentAction) -> Result<()> {
    let pipeline = InkPipeline::open(config)?;
    let consent = pipeline.consent();

    match action {
        ConsentAction::Grant { scopes, ttl_days } => {
            let ttl = ttl_days.map(|days| Duration::from_secs(days * 24 * 60 * 60));
            let record = consent.grant(&scopes, ttl)?;
            println!("Granted {:?}", record.scope);
        }
        ConsentAction::Revoke => match consent.revoke()? {
            Some(_) => println!("Consent revoked"),
            None => println!("No consent on record"),
        },
        ConsentAction::Status => match consent.current()? {
            Some(record) => {
                println!("{}", serde_json::to_string_pretty(&record)?);
                println!("OCR storage allowed: {}", consent.has_consent(ConsentScope::Ocr));
            }
            None => println!("No consent on record"),
        },
    }
    Ok(())
}
