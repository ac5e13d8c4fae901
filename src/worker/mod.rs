//! Recognition Worker
//!
//! Heavy inference runs on a dedicated thread so drawing never blocks:
//! - [`protocol`]: typed request/response messages with correlation ids
//! - [`runtime`]: the worker thread, owning the engines
//! - [`host`]: [`RecognitionService`], the caller-facing handle

pub mod host;
pub mod protocol;
pub mod runtime;

pub use host::{RecognitionService, ServiceConfig};
pub use protocol::{EngineOutputs, WorkerFailure, WorkerRequest, WorkerResponse};

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::RecognitionSettings;
use crate::vision::models::ModelManager;
use crate::vision::{DigitEngine, EngineSet, RemoteEngine, TextEngine};

/// Builds a fresh engine set for every worker generation
pub type EngineFactory = Arc<dyn Fn() -> EngineSet + Send + Sync>;

/// Devices with two or fewer cores send `auto` requests to the remote engine
pub fn is_resource_constrained(settings: &RecognitionSettings) -> bool {
    settings.resource_constrained.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get() <= 2)
            .unwrap_or(true)
    })
}

/// Engines described by the settings
///
/// Construction is cheap; models load when the worker sends `init`.
pub fn build_engines(settings: &RecognitionSettings) -> EngineSet {
    let mut engines = EngineSet::new().with_digit(Box::new(DigitEngine::new()));

    let models = match &settings.model_dir {
        Some(dir) => ModelManager::with_dir(dir.clone(), settings.allow_model_download),
        None => ModelManager::new(settings.allow_model_download),
    };
    match models {
        Ok(models) => engines = engines.with_text(Box::new(TextEngine::new(models))),
        Err(e) => warn!("Text engine disabled, no models directory: {:#}", e),
    }

    if !settings.remote_endpoints.is_empty() {
        match RemoteEngine::new(
            settings.remote_endpoints.clone(),
            Duration::from_millis(settings.remote_timeout_ms),
        ) {
            Ok(remote) => engines = engines.with_remote(Box::new(remote)),
            Err(e) => warn!("Remote engine disabled: {}", e),
        }
    }

    engines
}

/// Factory rebuilding [`build_engines`] for every worker generation
pub fn engines_from_settings(settings: &RecognitionSettings) -> EngineFactory {
    let settings = settings.clone();
    Arc::new(move || build_engines(&settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_constrained_override() {
        let mut settings = RecognitionSettings {
            resource_constrained: Some(true),
            ..Default::default()
        };
        assert!(is_resource_constrained(&settings));
        settings.resource_constrained = Some(false);
        assert!(!is_resource_constrained(&settings));
    }

    #[test]
    fn test_build_engines_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RecognitionSettings {
            model_dir: Some(dir.path().to_path_buf()),
            remote_endpoints: vec!["http://127.0.0.1:9".into()],
            ..Default::default()
        };

        let mut engines = build_engines(&settings);
        assert!(engines.text.is_some());
        assert!(engines.digit.is_some());
        assert!(engines.has_remote());

        // Text model missing and downloads off: only text fails to init
        let failures = engines.init_all();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("text"));
    }

    #[test]
    fn test_no_remote_without_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RecognitionSettings {
            model_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert!(!build_engines(&settings).has_remote());
    }
}
