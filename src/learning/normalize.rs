//! Text normalization for correction lookup keys.

use crate::vision::fusion::canonicalize_currency;

/// Devanagari digits U+0966..=U+096F map to ASCII `0`..=`9`
fn ascii_digit(c: char) -> char {
    match c {
        '\u{0966}'..='\u{096F}' => char::from(b'0' + (c as u32 - 0x0966) as u8),
        _ => c,
    }
}

/// Lookup key for a piece of recognized text
///
/// Lowercases, canonicalizes currency markers to `₹`, folds Devanagari
/// digits to ASCII and collapses runs of whitespace.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let canonical = canonicalize_currency(&lowered);
    let folded: String = canonical.chars().map(ascii_digit).collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}
