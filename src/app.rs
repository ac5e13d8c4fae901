//! Application Coordinator
//!
//! Wires stroke extraction, the recognition worker, adaptive bias, consent
//! and the encrypted store into one pipeline.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::capture::{CanvasSize, Stroke};
use crate::config::AppConfig;
use crate::error::{RecognitionError, StoreResult};
use crate::learning::{AdaptiveCorrectionStore, Correction};
use crate::storage::telemetry::retention_days;
use crate::storage::{ConsentGate, ConsentScope, EncryptedStore, SessionCredential, Telemetry, TelemetryLog};
use crate::vision::{ImageExtractor, RecognitionOptions, RecognitionToken};
use crate::worker::RecognitionService;

/// Result of recognizing one drawing, kept until the user confirms it
#[derive(Debug, Clone)]
pub struct Recognition {
    /// Fused and biased tokens, boxes in canvas coordinates
    pub tokens: Vec<RecognitionToken>,
    /// PNG sent to the engines
    pub image_png: Vec<u8>,
    pub stroke_ids: Vec<String>,
    pub locale: String,
}

impl Recognition {
    /// Tokens joined in reading order
    pub fn text(&self) -> String {
        self.tokens
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Engine output before adaptive bias, joined in reading order
    pub fn engine_text(&self) -> String {
        self.tokens
            .iter()
            .map(|t| t.engine_text())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Pairs of (engine text, accepted text, confidence) the user changed
    ///
    /// With one accepted word per token each token is paired with its word.
    /// Otherwise the whole recognition forms a single pair.
    pub fn corrected_pairs(&self, accepted_text: &str) -> Vec<(String, String, f32)> {
        let words: Vec<&str> = accepted_text.split_whitespace().collect();
        if !self.tokens.is_empty() && words.len() == self.tokens.len() {
            return self
                .tokens
                .iter()
                .zip(words)
                .filter(|(token, word)| token.text != *word)
                .map(|(token, word)| (token.engine_text().to_string(), word.to_string(), token.confidence))
                .collect();
        }

        let recognized = self.engine_text();
        if recognized.is_empty() || self.text() == accepted_text {
            return Vec::new();
        }
        vec![(recognized, accepted_text.to_string(), self.confidence())]
    }

    /// Mean token confidence, 0.0 when nothing was recognized
    pub fn confidence(&self) -> f32 {
        if self.tokens.is_empty() {
            return 0.0;
        }
        self.tokens.iter().map(|t| t.confidence).sum::<f32>() / self.tokens.len() as f32
    }
}

/// What a confirmation persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfirmOutcome {
    pub correction_saved: bool,
    pub telemetry_saved: bool,
}

/// Main pipeline coordinator
pub struct InkPipeline {
    config: AppConfig,
    extractor: ImageExtractor,
    service: RecognitionService,
    learning: AdaptiveCorrectionStore,
    consent: ConsentGate,
    telemetry: TelemetryLog,
}

impl InkPipeline {
    pub fn new(config: AppConfig, store: Arc<EncryptedStore>, service: RecognitionService) -> Self {
        Self {
            extractor: ImageExtractor::new(config.extraction.clone()),
            learning: AdaptiveCorrectionStore::new(store.clone(), config.learning.clone()),
            consent: ConsentGate::new(store.clone()),
            telemetry: TelemetryLog::new(store),
            service,
            config,
        }
    }

    /// Pipeline backed by the database in the data dir and engines from the config
    pub fn open(config: AppConfig) -> Result<Self> {
        let db_path = crate::storage::get_data_dir()?.join(&config.privacy.database_file);
        let store = EncryptedStore::open(&db_path).with_context(|| format!("Failed to open {:?}", db_path))?;
        let service = RecognitionService::from_settings(&config.recognition);
        Ok(Self::new(config, Arc::new(store), service))
    }

    /// Load learned corrections for this session
    pub fn unlock(&self, credential: &SessionCredential) -> StoreResult<usize> {
        self.learning.initialize(credential)
    }

    /// Options built from the configured defaults
    pub fn default_options(&self) -> RecognitionOptions {
        RecognitionOptions {
            mode: self.config.recognition.default_mode,
            language: self.config.recognition.language.clone(),
            ..Default::default()
        }
    }

    /// Extract, recognize, fuse and bias
    pub async fn recognize_strokes(
        &self,
        strokes: &[Stroke],
        canvas: CanvasSize,
        options: RecognitionOptions,
    ) -> Result<Recognition, RecognitionError> {
        let extracted = self
            .extractor
            .extract(strokes, canvas)
            .ok_or(RecognitionError::InputNotReady)?;
        let image_png = extracted.to_png()?;
        debug!(
            "Extracted {}x{} bitmap from {} strokes",
            extracted.width(),
            extracted.height(),
            strokes.len()
        );

        let tokens = self.service.recognize(image_png.clone(), options).await?;
        let tokens = self
            .learning
            .apply_adaptive_bias(tokens)
            .into_iter()
            .map(|mut token| {
                token.bounding_box = extracted.to_canvas(&token.bounding_box);
                token
            })
            .collect();

        Ok(Recognition {
            tokens,
            image_png,
            stroke_ids: strokes.iter().map(|s| s.id().to_string()).collect(),
            locale: self.config.recognition.language.clone(),
        })
    }

    /// Record what the user accepted for a recognition
    ///
    /// Nothing is written without OCR consent. Corrections are keyed on the
    /// engine output, so a later fix replaces an earlier one for the same
    /// input even after bias has rewritten what the user saw.
    pub fn confirm(
        &self,
        recognition: &Recognition,
        accepted_text: &str,
        credential: &SessionCredential,
    ) -> StoreResult<ConfirmOutcome> {
        if !self.consent.has_consent(ConsentScope::Ocr) {
            debug!("No OCR consent, confirmation not persisted");
            return Ok(ConfirmOutcome::default());
        }

        let recognized = recognition.engine_text();
        let confidence = recognition.confidence();
        let mut outcome = ConfirmOutcome::default();

        for (engine_text, corrected, token_confidence) in recognition.corrected_pairs(accepted_text) {
            let correction = Correction::new(
                recognition.stroke_ids.clone(),
                engine_text,
                corrected,
                token_confidence,
                recognition.locale.clone(),
            );
            self.learning.save_correction(correction, credential)?;
            outcome.correction_saved = true;
        }

        let telemetry = Telemetry::new(&recognition.image_png, recognized, confidence)
            .with_correction(accepted_text)
            .with_strokes(recognition.stroke_ids.len())
            .with_session(self.session_label(), recognition.locale.clone());
        self.telemetry.record(&telemetry, credential)?;
        outcome.telemetry_saved = true;

        Ok(outcome)
    }

    fn session_label(&self) -> String {
        format!("{}-{}", std::process::id(), self.service.generation())
    }

    /// Drop telemetry past the configured retention window
    pub fn prune_telemetry(&self) -> StoreResult<usize> {
        self.telemetry
            .prune_expired(retention_days(self.config.privacy.telemetry_retention_days))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn service(&self) -> &RecognitionService {
        &self.service
    }

    pub fn consent(&self) -> &ConsentGate {
        &self.consent
    }

    pub fn learning(&self) -> &AdaptiveCorrectionStore {
        &self.learning
    }

    pub fn telemetry(&self) -> &TelemetryLog {
        &self.telemetry
    }

    /// Stop the recognition worker
    pub async fn shutdown(&self) {
        self.service.destroy().await;
        info!("Pipeline shut down");
    }
}
