//! Result fusion
//!
//! Merges the token lists of the text-oriented and digit-oriented engines
//! into one list in reading order. Overlapping tokens are resolved in favour
//! of the digit engine when the token looks like an amount and the digit
//! engine is confident; otherwise the text engine wins.

use super::{BoundingBox, RecognitionToken, SourceEngine};

/// Minimum IoU for a digit token to pair with a text token
pub const MATCH_IOU: f32 = 0.3;
/// Digit token confidence needed to beat its matched text token
pub const PREFER_DIGIT_CONFIDENCE: f32 = 0.6;
/// Confidence needed to keep an unmatched digit token
pub const STANDALONE_DIGIT_CONFIDENCE: f32 = 0.5;
/// Share of digit characters that makes a token numeric-dominant
pub const NUMERIC_DOMINANCE: f32 = 0.6;
/// Vertical distance within which tokens share a row
pub const ROW_TOLERANCE_PX: f32 = 20.0;

/// Canonical currency symbol
pub const CURRENCY: char = '₹';

const SYMBOL_MARKERS: [char; 4] = ['$', '€', '£', '¥'];
/// Word-like markers, matched case-insensitively at word boundaries
const WORD_MARKERS: [&str; 2] = ["rs.", "inr"];

/// Rewrite every currency marker to `₹`
///
/// `Rs.` and `INR` only count when they are not glued to other letters, so
/// words like "PRINRT" stay untouched.
pub fn canonicalize_currency(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if SYMBOL_MARKERS.contains(&c) {
            out.push(CURRENCY);
            i += 1;
            continue;
        }

        let starts_word = i == 0 || !chars[i - 1].is_alphabetic();
        let matched = starts_word
            .then(|| {
                WORD_MARKERS.iter().find(|marker| {
                    let len = marker.chars().count();
                    if i + len > chars.len() {
                        return false;
                    }
                    let candidate: String = chars[i..i + len].iter().collect::<String>().to_lowercase();
                    let ends_word = chars.get(i + len).map(|n| !n.is_alphabetic()).unwrap_or(true);
                    candidate == **marker && ends_word
                })
            })
            .flatten();

        match matched {
            Some(marker) => {
                out.push(CURRENCY);
                i += marker.chars().count();
            }
            None => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Whether the text carries any currency marker
pub fn has_currency_marker(text: &str) -> bool {
    canonicalize_currency(text).contains(CURRENCY)
}

/// More than 60% of the non-whitespace characters are digits
pub fn is_numeric_dominant(text: &str) -> bool {
    let (digits, total) = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .fold((0usize, 0usize), |(d, t), c| (d + c.is_ascii_digit() as usize, t + 1));
    total > 0 && digits as f32 / total as f32 > NUMERIC_DOMINANCE
}

/// Amount normalization: currency to `₹`, then only digits, `.` and `,`
pub fn normalize_numeric(text: &str) -> String {
    let canonical = canonicalize_currency(text);
    let number: String = canonical
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if canonical.contains(CURRENCY) {
        format!("{CURRENCY}{number}")
    } else {
        number
    }
}

fn looks_like_amount(text: &str) -> bool {
    is_numeric_dominant(text) || has_currency_marker(text)
}

fn merged(text: String, confidence: f32, bounding_box: BoundingBox) -> RecognitionToken {
    RecognitionToken::new(text, confidence, bounding_box, SourceEngine::Merged)
}

/// Merge text-engine and digit-engine tokens into one list
///
/// Identity when either side is empty.
pub fn merge_results(text_tokens: Vec<RecognitionToken>, digit_tokens: Vec<RecognitionToken>) -> Vec<RecognitionToken> {
    if digit_tokens.is_empty() {
        return text_tokens;
    }
    if text_tokens.is_empty() {
        return digit_tokens;
    }

    let mut used = vec![false; text_tokens.len()];
    let mut result = Vec::with_capacity(text_tokens.len() + digit_tokens.len());

    for digit in digit_tokens {
        let best = text_tokens
            .iter()
            .enumerate()
            .filter(|(i, _)| !used[*i])
            .map(|(i, t)| (i, digit.bounding_box.iou(&t.bounding_box)))
            .filter(|(_, iou)| *iou >= MATCH_IOU)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((index, _)) => {
                used[index] = true;
                let text = &text_tokens[index];
                let bounds = digit.bounding_box.union(&text.bounding_box);
                if looks_like_amount(&digit.text) && digit.confidence > PREFER_DIGIT_CONFIDENCE {
                    result.push(merged(normalize_numeric(&digit.text), digit.confidence, bounds));
                } else {
                    result.push(merged(text.text.clone(), text.confidence, bounds));
                }
            }
            None => {
                if looks_like_amount(&digit.text) && digit.confidence > STANDALONE_DIGIT_CONFIDENCE {
                    let normalized = normalize_numeric(&digit.text);
                    if !normalized.is_empty() {
                        result.push(RecognitionToken {
                            text: normalized,
                            ..digit
                        });
                    }
                }
            }
        }
    }

    result.extend(
        text_tokens
            .into_iter()
            .zip(used)
            .filter(|(_, used)| !used)
            .map(|(token, _)| token),
    );

    sort_reading_order(&mut result);
    result
}

/// Sort top-to-bottom in rows of ±20px, then left-to-right within a row
pub fn sort_reading_order(tokens: &mut Vec<RecognitionToken>) {
    tokens.sort_by(|a, b| a.bounding_box.y.total_cmp(&b.bounding_box.y));

    let mut rows: Vec<Vec<RecognitionToken>> = Vec::new();
    let mut row_top = f32::NEG_INFINITY;
    for token in tokens.drain(..) {
        match rows.last_mut() {
            Some(row) if token.bounding_box.y - row_top <= ROW_TOLERANCE_PX => row.push(token),
            _ => {
                row_top = token.bounding_box.y;
                rows.push(vec![token]);
            }
        }
    }

    for mut row in rows {
        row.sort_by(|a, b| a.bounding_box.x.total_cmp(&b.bounding_box.x));
        tokens.extend(row);
    }
}
