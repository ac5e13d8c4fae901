//! InkLedger - on-device handwriting recognition for ledger entry
//!
//! Strokes go in, confidence-scored tokens come out. Recognition runs on an
//! isolated worker thread with several engines whose results are fused and
//! then biased by what the user corrected before. Corrections and telemetry
//! are only stored with consent, encrypted under the session PIN.

pub mod app;
pub mod capture;
pub mod config;
pub mod error;
pub mod learning;
pub mod storage;
pub mod vision;
pub mod worker;

pub use app::{InkPipeline, Recognition};
pub use error::{RecognitionError, StoreError};
