//! On-device text engine
//!
//! Runs the PaddleOCR CRNN recognizer over the whole extracted bitmap as a
//! single text line and greedily decodes the CTC output into word tokens.

use anyhow::{Context, Result};
use image::{Rgba, RgbaImage};
use ndarray::{ArrayView2, Ix3};
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use super::engine::{EngineAdapter, EngineKind};
use super::models::{self, ModelManager, ModelType};
use super::preprocess::{preprocess_for_recognition, recognizer_width, RecognizerInputConfig};
use super::{is_whitelisted, BoundingBox, RecognitionOptions, RecognitionToken, SourceEngine};

/// One character kept by the CTC decoder
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChar {
    pub symbol: String,
    pub probability: f32,
    /// Output timestep the character was emitted at
    pub step: usize,
}

/// Greedy CTC decode of a [timesteps, classes] probability matrix
///
/// Class 0 is the blank; class `i` maps to `dictionary[i - 1]`. Repeats
/// collapse unless separated by a blank, and symbols outside the character
/// whitelist are dropped.
pub fn ctc_greedy_decode(probs: ArrayView2<f32>, dictionary: &[String]) -> Vec<DecodedChar> {
    let mut decoded = Vec::new();
    let mut previous = 0usize;

    for (step, row) in probs.outer_iter().enumerate() {
        let (class, probability) = row
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        if class != 0 && class != previous {
            if let Some(symbol) = dictionary.get(class - 1) {
                if symbol.chars().all(is_whitelisted) {
                    decoded.push(DecodedChar {
                        symbol: symbol.clone(),
                        probability,
                        step,
                    });
                }
            }
        }
        previous = class;
    }

    decoded
}

/// Group decoded characters into space-separated words
///
/// Each word's box spans its first to last timestep, `px_per_step` wide per
/// step, at full line height. Confidence is the mean character probability.
pub fn group_words(chars: &[DecodedChar], px_per_step: f32, line_height: f32) -> Vec<(String, f32, BoundingBox)> {
    let mut words = Vec::new();
    let mut current: Vec<&DecodedChar> = Vec::new();

    let mut flush = |current: &mut Vec<&DecodedChar>| {
        if current.is_empty() {
            return;
        }
        let text: String = current.iter().map(|c| c.symbol.as_str()).collect();
        let confidence = current.iter().map(|c| c.probability).sum::<f32>() / current.len() as f32;
        let first = current[0].step as f32;
        let last = current[current.len() - 1].step as f32;
        let bbox = BoundingBox::new(first * px_per_step, 0.0, (last - first + 1.0) * px_per_step, line_height);
        words.push((text, confidence, bbox));
        current.clear();
    };

    for c in chars {
        if c.symbol.trim().is_empty() {
            flush(&mut current);
        } else {
            current.push(c);
        }
    }
    flush(&mut current);

    words
}

/// PaddleOCR recognition via ONNX Runtime
pub struct TextEngine {
    models: ModelManager,
    input_config: RecognizerInputConfig,
    session: Option<Session>,
    dictionary: Vec<String>,
}

impl TextEngine {
    pub fn new(models: ModelManager) -> Self {
        Self {
            models,
            input_config: RecognizerInputConfig::default(),
            session: None,
            dictionary: Vec::new(),
        }
    }

    pub fn with_input_config(mut self, config: RecognizerInputConfig) -> Self {
        self.input_config = config;
        self
    }

    fn intra_threads() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(4)
    }

    fn run_line(&mut self, image: &RgbaImage) -> Result<Vec<RecognitionToken>> {
        let session = self.session.as_mut().context("Text engine not initialized")?;

        let input = preprocess_for_recognition(image, &self.input_config);
        let padded_width = input.dim().3 as f32;
        let tensor = Tensor::from_array(input)?;

        let outputs = session.run(ort::inputs![tensor])?;
        let probs = outputs[0].try_extract_array::<f32>()?.into_dimensionality::<Ix3>()?;
        let steps = probs.dim().1;
        if steps == 0 {
            return Ok(Vec::new());
        }
        let chars = ctc_greedy_decode(probs.index_axis(ndarray::Axis(0), 0), &self.dictionary);

        // timestep -> resized pixels -> bitmap pixels
        let resized_width = recognizer_width(image.width(), image.height(), &self.input_config) as f32;
        let px_per_step = (padded_width / steps as f32) * (image.width() as f32 / resized_width);

        let tokens = group_words(&chars, px_per_step, image.height() as f32)
            .into_iter()
            .map(|(text, confidence, bbox)| RecognitionToken::new(text, confidence, bbox, SourceEngine::Text))
            .collect::<Vec<_>>();

        debug!("Text engine decoded {} chars into {} tokens", chars.len(), tokens.len());
        Ok(tokens)
    }
}

impl EngineAdapter for TextEngine {
    fn name(&self) -> &str {
        "text"
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Text
    }

    fn is_ready(&self) -> bool {
        self.session.is_some() && !self.dictionary.is_empty()
    }

    fn init(&mut self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        let model_path = self.models.ensure_model(ModelType::Recognition)?;
        let dict_path = self.models.ensure_model(ModelType::Dictionary)?;

        self.dictionary = models::load_dictionary(&dict_path)?;
        self.session = Some(models::load_session(&model_path, Self::intra_threads())?);
        info!("Text engine ready ({} symbols)", self.dictionary.len());
        Ok(())
    }

    fn warmup(&mut self) -> Result<()> {
        let blank = RgbaImage::from_pixel(300, 100, Rgba([255, 255, 255, 255]));
        self.run_line(&blank).map(|_| ())
    }

    fn recognize(&mut self, image: &RgbaImage, _options: &RecognitionOptions) -> Result<Vec<RecognitionToken>> {
        self.run_line(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn dictionary() -> Vec<String> {
        ["0", "1", "5", "A", "§", " "].iter().map(|s| s.to_string()).collect()
    }

    /// One-hot rows with the given probability; class indexes include blank=0
    fn probs(classes: &[usize], p: f32) -> Array2<f32> {
        let mut m = Array2::<f32>::zeros((classes.len(), 7));
        for (t, &c) in classes.iter().enumerate() {
            m[[t, c]] = p;
        }
        m
    }

    #[test]
    fn test_ctc_collapses_repeats_and_blanks() {
        // 5 5 _ 0 0 _ 0 -> "500"
        let m = probs(&[3, 3, 0, 1, 1, 0, 1], 0.9);
        let chars = ctc_greedy_decode(m.view(), &dictionary());
        let text: String = chars.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(text, "500");
        assert_eq!(chars[0].step, 0);
        assert_eq!(chars[2].step, 6);
    }

    #[test]
    fn test_ctc_drops_non_whitelisted() {
        // "§" is index 5 in the dictionary -> class 5
        let m = probs(&[4, 0, 5, 0, 2], 0.8);
        let chars = ctc_greedy_decode(m.view(), &dictionary());
        let text: String = chars.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(text, "A1");
    }

    #[test]
    fn test_ctc_all_blank_is_empty() {
        let m = probs(&[0, 0, 0], 0.99);
        assert!(ctc_greedy_decode(m.view(), &dictionary()).is_empty());
    }

    #[test]
    fn test_group_words_splits_on_space() {
        // "A 15" with the space class (6)
        let m = probs(&[4, 0, 6, 0, 2, 0, 3], 0.5);
        let chars = ctc_greedy_decode(m.view(), &dictionary());
        let words = group_words(&chars, 10.0, 48.0);

        assert_eq!(words.len(), 2);
        assert_eq!(words[0].0, "A");
        assert_eq!(words[1].0, "15");
        assert!((words[1].1 - 0.5).abs() < 1e-6);
        // steps 4..=6 at 10px per step
        assert_eq!(words[1].2, BoundingBox::new(40.0, 0.0, 30.0, 48.0));
    }

    #[test]
    fn test_engine_without_models_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf(), false).unwrap();
        let mut engine = TextEngine::new(manager);

        assert!(!engine.is_ready());
        assert!(engine.init().is_err());
        assert!(!engine.is_ready());
        let image = RgbaImage::new(300, 100);
        assert!(engine.recognize(&image, &RecognitionOptions::default()).is_err());
    }
}
