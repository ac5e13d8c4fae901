//! Adaptive Correction Learning
//!
//! Remembers what the user corrected recognized text to, and biases later
//! recognitions of the same (or nearly the same) text toward that correction.
//! Corrections are persisted encrypted; the lookup index lives in memory and
//! is rebuilt from the log on [`AdaptiveCorrectionStore::initialize`].

pub mod normalize;

pub use normalize::normalize;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::LearningSettings;
use crate::error::StoreResult;
use crate::storage::{Collection, EncryptedStore, SessionCredential};
use crate::vision::{BiasTag, RecognitionToken};

/// Confidence ceiling after an exact-match rewrite
pub const EXACT_CONFIDENCE_CAP: f32 = 0.95;
pub const EXACT_CONFIDENCE_BOOST: f32 = 0.15;
/// Confidence ceiling after a fuzzy rewrite
pub const FUZZY_CONFIDENCE_CAP: f32 = 0.90;
/// Fuzzy boost per unit of similarity
pub const FUZZY_CONFIDENCE_BOOST: f32 = 0.10;

/// A user-confirmed fix of recognized text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub id: String,
    /// Strokes the recognized text came from
    pub source_stroke_ids: Vec<String>,
    pub recognized_text: String,
    pub corrected_text: String,
    /// Recognition confidence at the time of correction
    pub confidence: f32,
    pub locale: String,
    pub timestamp_ms: i64,
}

impl Correction {
    pub fn new(
        source_stroke_ids: Vec<String>,
        recognized_text: impl Into<String>,
        corrected_text: impl Into<String>,
        confidence: f32,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_stroke_ids,
            recognized_text: recognized_text.into(),
            corrected_text: corrected_text.into(),
            confidence,
            locale: locale.into(),
            timestamp_ms: crate::storage::now_ms(),
        }
    }

    fn key(&self) -> String {
        normalize(&self.recognized_text)
    }
}

#[derive(Default)]
struct Learned {
    /// Every correction, oldest first
    log: Vec<Correction>,
    /// normalized recognized text -> most recent learnable correction
    index: HashMap<String, Correction>,
}

impl Learned {
    fn push(&mut self, correction: Correction, min_confidence: f32) {
        if correction.confidence >= min_confidence {
            let key = correction.key();
            let newer = self
                .index
                .get(&key)
                .map(|existing| correction.timestamp_ms >= existing.timestamp_ms)
                .unwrap_or(true);
            if newer {
                self.index.insert(key, correction.clone());
            }
        }
        self.log.push(correction);
    }
}

/// Per-device correction memory
pub struct AdaptiveCorrectionStore {
    store: Arc<EncryptedStore>,
    settings: LearningSettings,
    learned: RwLock<Learned>,
}

impl AdaptiveCorrectionStore {
    pub fn new(store: Arc<EncryptedStore>, settings: LearningSettings) -> Self {
        Self {
            store,
            settings,
            learned: RwLock::new(Learned::default()),
        }
    }

    /// Rebuild the in-memory log and index from the encrypted store
    ///
    /// Returns the number of corrections loaded. A wrong credential fails
    /// with a decryption error and leaves the current state untouched.
    pub fn initialize(&self, credential: &SessionCredential) -> StoreResult<usize> {
        let mut corrections: Vec<Correction> = self
            .store
            .load_all::<Correction>(Collection::Corrections, credential)?
            .into_iter()
            .map(|(_, correction)| correction)
            .collect();
        corrections.sort_by_key(|c| c.timestamp_ms);

        let mut learned = Learned::default();
        for correction in corrections {
            learned.push(correction, self.settings.min_learn_confidence);
        }

        let count = learned.log.len();
        *self.learned.write() = learned;
        info!("Loaded {} corrections", count);
        Ok(count)
    }

    /// Persist a correction and learn from it
    ///
    /// Corrections recorded below `min_learn_confidence` are kept in the log
    /// but never used for biasing.
    pub fn save_correction(&self, correction: Correction, credential: &SessionCredential) -> StoreResult<()> {
        self.store.insert(Collection::Corrections, &correction, credential)?;

        if correction.confidence < self.settings.min_learn_confidence {
            debug!(
                "Correction {} below learn floor ({:.2} < {:.2})",
                correction.id, correction.confidence, self.settings.min_learn_confidence
            );
        }
        self.learned
            .write()
            .push(correction, self.settings.min_learn_confidence);
        Ok(())
    }

    /// Rewrite tokens the user has corrected before
    ///
    /// Exact key matches win over fuzzy ones. Fuzzy matches need a normalized
    /// Levenshtein similarity of at least the configured threshold; ties go to
    /// the most recent correction. Tokens with no match pass through unchanged.
    pub fn apply_adaptive_bias(&self, tokens: Vec<RecognitionToken>) -> Vec<RecognitionToken> {
        let learned = self.learned.read();
        if learned.index.is_empty() {
            return tokens;
        }

        tokens
            .into_iter()
            .map(|token| self.bias_token(&learned.index, token))
            .collect()
    }

    fn bias_token(&self, index: &HashMap<String, Correction>, mut token: RecognitionToken) -> RecognitionToken {
        let key = normalize(token.engine_text());

        if let Some(correction) = index.get(&key) {
            if token.raw_text.is_none() {
                token.raw_text = Some(token.text.clone());
            }
            token.text = correction.corrected_text.clone();
            token.confidence = (token.confidence + EXACT_CONFIDENCE_BOOST).min(EXACT_CONFIDENCE_CAP);
            token.bias = Some(BiasTag::ExactMatch);
            return token;
        }

        let best = index
            .iter()
            .map(|(candidate, correction)| (strsim::normalized_levenshtein(&key, candidate) as f32, correction))
            .filter(|(similarity, _)| *similarity >= self.settings.fuzzy_threshold)
            .max_by(|(sa, ca), (sb, cb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(ca.timestamp_ms.cmp(&cb.timestamp_ms))
            });

        if let Some((similarity, correction)) = best {
            if token.raw_text.is_none() {
                token.raw_text = Some(token.text.clone());
            }
            token.text = correction.corrected_text.clone();
            token.confidence = (token.confidence + FUZZY_CONFIDENCE_BOOST * similarity).min(FUZZY_CONFIDENCE_CAP);
            token.bias = Some(BiasTag::FuzzyMatch);
        }
        token
    }

    /// Every correction, oldest first
    pub fn history(&self) -> Vec<Correction> {
        self.learned.read().log.clone()
    }

    /// Corrections whose recognized text normalizes to the same key as `text`
    pub fn history_for(&self, text: &str) -> Vec<Correction> {
        let key = normalize(text);
        self.learned
            .read()
            .log
            .iter()
            .filter(|c| c.key() == key)
            .cloned()
            .collect()
    }

    /// Number of keys currently used for biasing
    pub fn learned_count(&self) -> usize {
        self.learned.read().index.len()
    }
}
