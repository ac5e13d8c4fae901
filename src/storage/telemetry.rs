//! Recognition telemetry
//!
//! One encrypted record per recognition the user confirmed. The image itself
//! is never stored, only its SHA-256.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::crypto::SessionCredential;
use super::database::{Collection, EncryptedStore};
use crate::error::StoreResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub id: String,
    pub timestamp_ms: i64,
    /// Lowercase hex SHA-256 of the image bytes
    pub image_hash: String,
    pub recognized_text: String,
    pub corrected_text: Option<String>,
    pub confidence: f32,
    /// Image encoding sent to the engines
    pub format: String,
    pub device_type: String,
    pub screen_dpi: f32,
    pub stroke_count: usize,
    pub session_id: String,
    pub locale: String,
    /// Free-form context such as the target form field
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Telemetry {
    pub fn new(image_bytes: &[u8], recognized_text: impl Into<String>, confidence: f32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp_ms: super::now_ms(),
            image_hash: image_hash(image_bytes),
            recognized_text: recognized_text.into(),
            corrected_text: None,
            confidence,
            format: "png".to_string(),
            device_type: std::env::consts::OS.to_string(),
            screen_dpi: 96.0,
            stroke_count: 0,
            session_id: String::new(),
            locale: "en".to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_correction(mut self, corrected_text: impl Into<String>) -> Self {
        self.corrected_text = Some(corrected_text.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>, locale: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self.locale = locale.into();
        self
    }

    pub fn with_strokes(mut self, stroke_count: usize) -> Self {
        self.stroke_count = stroke_count;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Whether the user changed the recognized text
    pub fn was_corrected(&self) -> bool {
        matches!(&self.corrected_text, Some(corrected) if *corrected != self.recognized_text)
    }
}

/// SHA-256 of `bytes` as lowercase hex
pub fn image_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Local aggregate over stored telemetry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySummary {
    pub count: usize,
    pub mean_confidence: f32,
    /// Fraction of records whose text the user corrected
    pub correction_rate: f32,
}

/// Append-only telemetry log over the encrypted store
#[derive(Clone)]
pub struct TelemetryLog {
    store: Arc<EncryptedStore>,
}

impl TelemetryLog {
    pub fn new(store: Arc<EncryptedStore>) -> Self {
        Self { store }
    }

    /// Encrypt and append; the row is stamped with the record's own timestamp
    pub fn record(&self, telemetry: &Telemetry, credential: &SessionCredential) -> StoreResult<i64> {
        self.store
            .insert_at(Collection::Telemetry, telemetry, credential, telemetry.timestamp_ms)
    }

    pub fn all(&self, credential: &SessionCredential) -> StoreResult<Vec<Telemetry>> {
        Ok(self
            .store
            .load_all::<Telemetry>(Collection::Telemetry, credential)?
            .into_iter()
            .map(|(_, telemetry)| telemetry)
            .collect())
    }

    /// Drop records older than `retention`
    pub fn prune_expired(&self, retention: Duration) -> StoreResult<usize> {
        self.prune_expired_at(retention, super::now_ms())
    }

    pub fn prune_expired_at(&self, retention: Duration, now_ms: i64) -> StoreResult<usize> {
        let cutoff = now_ms.saturating_sub(retention.as_millis() as i64);
        let pruned = self.store.delete_older_than(Collection::Telemetry, cutoff)?;
        if pruned > 0 {
            info!("Pruned {} telemetry records", pruned);
        }
        Ok(pruned)
    }

    pub fn summary(&self, credential: &SessionCredential) -> StoreResult<TelemetrySummary> {
        let records = self.all(credential)?;
        if records.is_empty() {
            return Ok(TelemetrySummary::default());
        }

        let count = records.len();
        let mean_confidence = records.iter().map(|t| t.confidence).sum::<f32>() / count as f32;
        let corrected = records.iter().filter(|t| t.was_corrected()).count();

        Ok(TelemetrySummary {
            count,
            mean_confidence,
            correction_rate: corrected as f32 / count as f32,
        })
    }
}

/// Retention window from a day count
pub fn retention_days(days: u32) -> Duration {
    Duration::from_secs(u64::from(days) * 24 * 60 * 60)
}
