//! Vision/OCR Layer
//!
//! Turns finalized strokes into a recognizer-friendly bitmap and runs it
//! through one or more recognition engines:
//! - TextEngine: PaddleOCR recognition model via ONNX Runtime
//! - DigitEngine: no-op adapter (no on-device digit model ships yet)
//! - RemoteEngine: HTTP OCR endpoint with an optional fallback endpoint
//!
//! Engine outputs are merged by [`fusion`].

pub mod engine;
pub mod extract;
pub mod fusion;
pub mod models;
pub mod ocr_preprocess;
pub mod preprocess;
pub mod remote;
pub mod text_engine;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use engine::{DigitEngine, EngineAdapter, EngineKind, EngineSet};
pub use extract::{ExtractedImage, ImageExtractor};
pub use fusion::merge_results;
pub use remote::RemoteEngine;
pub use text_engine::TextEngine;

/// Characters the engines are allowed to emit: alphanumerics plus common
/// currency and punctuation found on ledger entries
pub const CHARACTER_WHITELIST: &str =
    "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz₹$€£¥.,:-/()%#@&+ ";

/// Whether a character may appear in recognized text
pub fn is_whitelisted(c: char) -> bool {
    CHARACTER_WHITELIST.contains(c)
}

/// Engine selection for a recognition request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionMode {
    /// Every locally available engine, results fused
    #[default]
    Auto,
    /// Text-oriented engine only
    Text,
    /// Digit/symbol-oriented engine only
    Digit,
    /// Skip local inference and post to the remote endpoint
    Backend,
}

impl std::str::FromStr for RecognitionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "text" => Ok(Self::Text),
            "digit" => Ok(Self::Digit),
            "backend" => Ok(Self::Backend),
            other => Err(format!("unknown recognition mode: {other}")),
        }
    }
}

/// Which engine produced a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceEngine {
    Text,
    Digit,
    Remote,
    Merged,
}

/// How adaptive bias rewrote a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BiasTag {
    ExactMatch,
    FuzzyMatch,
}

/// Axis-aligned box in image pixels
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn right(&self) -> f32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }

    /// Intersection-over-union with another box (0.0 when disjoint)
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.right().min(other.right()) - self.x.max(other.x)).max(0.0);
        let iy = (self.bottom().min(other.bottom()) - self.y.max(other.y)).max(0.0);
        let intersection = ix * iy;
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }

    /// Smallest box containing both
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        BoundingBox {
            x,
            y,
            w: self.right().max(other.right()) - x,
            h: self.bottom().max(other.bottom()) - y,
        }
    }

    /// Map a box found in a scaled crop back to source coordinates
    pub fn unscale(&self, offset_x: f32, offset_y: f32, scale: f32) -> BoundingBox {
        let scale = if scale > 0.0 { scale } else { 1.0 };
        BoundingBox {
            x: offset_x + self.x / scale,
            y: offset_y + self.y / scale,
            w: self.w / scale,
            h: self.h / scale,
        }
    }
}

/// A single recognized text fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionToken {
    /// Token identifier
    pub id: String,
    /// Recognized text
    pub text: String,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
    /// Region of the image the text came from
    pub bounding_box: BoundingBox,
    /// Engine that produced the token
    pub source_engine: SourceEngine,
    /// Set when adaptive bias rewrote the text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<BiasTag>,
    /// Engine output before bias, present only when `bias` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
}

impl RecognitionToken {
    /// Create a token with a fresh id; confidence is clamped to [0, 1]
    pub fn new(
        text: impl Into<String>,
        confidence: f32,
        bounding_box: BoundingBox,
        source_engine: SourceEngine,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bounding_box,
            source_engine,
            bias: None,
            raw_text: None,
        }
    }

    /// Text as the engines produced it
    pub fn engine_text(&self) -> &str {
        self.raw_text.as_deref().unwrap_or(&self.text)
    }
}

/// Per-request recognition options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionOptions {
    /// Engine selection
    pub mode: RecognitionMode,
    /// Language hint (e.g., "en")
    pub language: String,
    /// Sub-regions to recognize separately; empty means the whole image
    #[serde(default)]
    pub regions_of_interest: Vec<BoundingBox>,
    /// Form field the entry is destined for, forwarded to the remote endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_field: Option<String>,
}

impl RecognitionOptions {
    pub fn with_mode(mut self, mode: RecognitionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Image plus options handed to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionRequest {
    /// PNG-encoded bitmap
    pub image_bytes: Vec<u8>,
    pub options: RecognitionOptions,
    pub request_id: String,
}
