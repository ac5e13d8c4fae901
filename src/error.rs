//! Error types for the recognition pipeline and the encrypted store.
//!
//! Callers branch on these, so they are typed. Configuration and model
//! management stay on `anyhow` like the rest of the edges.

use thiserror::Error;

/// Failures surfaced by the recognition path
#[derive(Error, Debug)]
pub enum RecognitionError {
    /// Nothing has been drawn yet; prompt the user, never retry
    #[error("No strokes to recognize")]
    InputNotReady,

    /// The worker did not answer within the bound
    #[error("Recognition request {id} timed out after {timeout_ms}ms (safe to retry)")]
    WorkerTimeout { id: u64, timeout_ms: u64 },

    /// The worker died while the request was pending
    #[error("Recognition worker crashed: {message}")]
    WorkerCrash { message: String },

    /// Every engine in the fallback chain failed
    #[error("All recognition engines failed: {}", failures.join("; "))]
    Engine { failures: Vec<String> },

    /// The worker answered with something the host did not ask for
    #[error("Worker protocol error: {message}")]
    Protocol { message: String },

    /// The image could not be encoded or decoded
    #[error("Image encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    /// The service has been destroyed
    #[error("Recognition service is shut down")]
    ShutDown,
}

impl RecognitionError {
    /// Whether the caller may simply retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RecognitionError::WorkerTimeout { .. } | RecognitionError::WorkerCrash { .. }
        )
    }
}

/// Failures surfaced by the encrypted store and the consent log
#[derive(Error, Debug)]
pub enum StoreError {
    /// Authentication tag mismatch: wrong PIN or tampered row
    #[error("Failed to decrypt record {id}: wrong credential or corrupted data")]
    Decryption { id: i64 },

    /// Row layout does not match what was written
    #[error("Malformed encrypted record {id}: {message}")]
    Malformed { id: i64, message: String },

    /// Encryption itself failed
    #[error("Encryption failed: {message}")]
    Crypto { message: String },

    /// The database was written by a newer build
    #[error("Database schema version {found} is newer than supported version {supported}")]
    Schema { found: i32, supported: i32 },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
