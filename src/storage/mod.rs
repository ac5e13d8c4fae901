//! Storage Layer
//!
//! Encrypted corrections and telemetry, plus the plaintext consent log, in SQLite.

pub mod consent;
pub mod crypto;
pub mod database;
pub mod telemetry;

pub use consent::{ConsentGate, ConsentRecord, ConsentScope};
pub use crypto::SessionCredential;
pub use database::{Collection, EncryptedStore};
pub use telemetry::{Telemetry, TelemetryLog, TelemetrySummary};

use anyhow::Result;
use std::path::PathBuf;

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "inkledger", "InkLedger")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = project_dirs()?.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}
