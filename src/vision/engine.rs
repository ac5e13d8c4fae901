//! Recognition engine adapters
//!
//! Every engine sits behind [`EngineAdapter`] so the worker can dispatch by
//! mode without knowing which backend it is talking to.

use anyhow::Result;
use image::RgbaImage;

use super::{RecognitionOptions, RecognitionToken};

/// Which family an engine belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// On-device text recognizer
    Text,
    /// On-device digit/symbol recognizer
    Digit,
    /// HTTP OCR endpoint
    Remote,
}

impl EngineKind {
    pub fn is_local(&self) -> bool {
        !matches!(self, EngineKind::Remote)
    }
}

/// Uniform interface over recognition backends
///
/// Engines are owned by the worker thread and never shared, hence `&mut self`
/// and no `Sync` bound.
pub trait EngineAdapter: Send {
    /// Short name used in logs and aggregate errors
    fn name(&self) -> &str;

    fn kind(&self) -> EngineKind;

    /// Whether the engine can serve requests right now
    fn is_ready(&self) -> bool;

    /// Load models or resolve endpoints. Failing here marks the engine
    /// unavailable but is not fatal for the worker.
    fn init(&mut self) -> Result<()>;

    /// Run a throwaway inference so the first real request is fast
    fn warmup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Recognize a single bitmap; boxes are in bitmap pixels
    fn recognize(&mut self, image: &RgbaImage, options: &RecognitionOptions) -> Result<Vec<RecognitionToken>>;
}

/// Digit/symbol engine
///
/// No on-device digit model ships yet. The adapter is still a real engine so
/// `digit` mode and fusion exercise the same code paths a model would.
#[derive(Debug, Default)]
pub struct DigitEngine;

impl DigitEngine {
    pub fn new() -> Self {
        Self
    }
}

impl EngineAdapter for DigitEngine {
    fn name(&self) -> &str {
        "digit"
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Digit
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn recognize(&mut self, _image: &RgbaImage, _options: &RecognitionOptions) -> Result<Vec<RecognitionToken>> {
        Ok(Vec::new())
    }
}

/// The engines a worker owns for its lifetime
pub struct EngineSet {
    pub text: Option<Box<dyn EngineAdapter>>,
    pub digit: Option<Box<dyn EngineAdapter>>,
    /// Remote endpoints in priority order (primary, fallback)
    pub remote: Option<Box<dyn EngineAdapter>>,
}

impl EngineSet {
    pub fn new() -> Self {
        Self {
            text: None,
            digit: None,
            remote: None,
        }
    }

    pub fn with_text(mut self, engine: Box<dyn EngineAdapter>) -> Self {
        self.text = Some(engine);
        self
    }

    pub fn with_digit(mut self, engine: Box<dyn EngineAdapter>) -> Self {
        self.digit = Some(engine);
        self
    }

    pub fn with_remote(mut self, engine: Box<dyn EngineAdapter>) -> Self {
        self.remote = Some(engine);
        self
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Initialize every engine; failures leave that engine unavailable
    pub fn init_all(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        for engine in self.iter_mut() {
            if let Err(e) = engine.init() {
                tracing::warn!("Engine {} unavailable: {:#}", engine.name(), e);
                failures.push(format!("{}: {:#}", engine.name(), e));
            }
        }
        failures
    }

    /// Warm up every ready engine
    pub fn warmup_all(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        for engine in self.iter_mut() {
            if !engine.is_ready() {
                continue;
            }
            if let Err(e) = engine.warmup() {
                tracing::warn!("Warmup failed for {}: {:#}", engine.name(), e);
                failures.push(format!("{}: {:#}", engine.name(), e));
            }
        }
        failures
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn EngineAdapter>> {
        self.text
            .iter_mut()
            .chain(self.digit.iter_mut())
            .chain(self.remote.iter_mut())
    }
}

impl Default for EngineSet {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digit_engine_returns_nothing() {
        let mut engine = DigitEngine::new();
        engine.init().unwrap();
        let image = RgbaImage::new(300, 100);
        let tokens = engine.recognize(&image, &RecognitionOptions::default()).unwrap();
        assert!(tokens.is_empty());
        assert!(engine.is_ready());
        assert_eq!(engine.kind(), EngineKind::Digit);
    }

    #[test]
    fn test_engine_set_iterates_present_engines() {
        let mut set = EngineSet::new().with_digit(Box::new(DigitEngine::new()));
        assert_eq!(set.iter_mut().count(), 1);
        assert!(!set.has_remote());
        assert!(set.init_all().is_empty());
    }

    #[test]
    fn test_kind_locality() {
        assert!(EngineKind::Text.is_local());
        assert!(EngineKind::Digit.is_local());
        assert!(!EngineKind::Remote.is_local());
    }
}
