//! Application Configuration
//!
//! Capture, extraction, recognition, learning and privacy settings stored in TOML format.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::vision::RecognitionMode;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Stroke capture settings
    pub capture: CaptureSettings,
    /// Stroke-to-bitmap extraction settings
    pub extraction: ExtractionSettings,
    /// Engine dispatch settings
    pub recognition: RecognitionSettings,
    /// Adaptive correction settings
    pub learning: LearningSettings,
    /// Retention and storage settings
    pub privacy: PrivacySettings,
}

/// Pointer input gating
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Accept only pen input with pressure (palm rejection)
    pub stylus_only: bool,
    /// Strokes starting this close to the canvas border are ignored
    pub edge_dead_zone_px: f32,
    /// Movement needed before the first segment commits (tap suppression)
    pub min_movement_px: f32,
    /// Idle time after the last input before auto-recognition fires
    pub auto_recognize_idle_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            stylus_only: false,
            edge_dead_zone_px: 10.0,
            min_movement_px: 4.0,
            auto_recognize_idle_ms: 2000,
        }
    }
}

/// Rendering and binarization of finalized strokes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    /// Padding around the tight stroke bounding box
    pub padding_px: f32,
    /// Render upscale factor (clamped to at least 2)
    pub render_scale: u32,
    /// Stroke width in logical pixels before upscaling
    pub stroke_width_px: f32,
    /// Minimum output width for the recognizer
    pub min_width: u32,
    /// Minimum output height for the recognizer
    pub min_height: u32,
    /// Below this many black pixels the binarized result is discarded
    pub fallback_min_black_pixels: usize,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            padding_px: 16.0,
            render_scale: 2,
            stroke_width_px: 3.0,
            min_width: 300,
            min_height: 100,
            fallback_min_black_pixels: 10,
        }
    }
}

/// Engine dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionSettings {
    /// Mode used when the caller does not pick one
    pub default_mode: RecognitionMode,
    /// Language hint passed to engines (e.g., "en")
    pub language: String,
    /// Host-side bound on a single worker request
    pub timeout_ms: u64,
    /// Remote OCR endpoints, tried in order (primary, fallback)
    pub remote_endpoints: Vec<String>,
    /// Force or suppress backend mode; `None` detects from available CPUs
    pub resource_constrained: Option<bool>,
    /// Directory holding the recognition model; defaults to the data dir
    pub model_dir: Option<PathBuf>,
    /// Fetch missing models on init
    pub allow_model_download: bool,
    /// HTTP timeout for remote recognition
    pub remote_timeout_ms: u64,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            default_mode: RecognitionMode::Auto,
            language: "en".to_string(),
            timeout_ms: 10_000,
            remote_endpoints: Vec::new(),
            resource_constrained: None,
            model_dir: None,
            allow_model_download: false,
            remote_timeout_ms: 8_000,
        }
    }
}

/// Adaptive bias settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningSettings {
    /// Corrections recorded below this recognition confidence are logged but not learned
    pub min_learn_confidence: f32,
    /// Minimum normalized Levenshtein similarity for a fuzzy rewrite
    pub fuzzy_threshold: f32,
}

impl Default for LearningSettings {
    fn default() -> Self {
        Self {
            min_learn_confidence: 0.0,
            fuzzy_threshold: 0.7,
        }
    }
}

/// Retention and storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacySettings {
    /// Telemetry older than this is pruned
    pub telemetry_retention_days: u32,
    /// Database file name inside the data dir
    pub database_file: String,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            telemetry_retention_days: 90,
            database_file: "inkledger.db".to_string(),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
