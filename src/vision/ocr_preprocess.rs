//! Pixel filters that prepare rendered ink for OCR
//!
//! All filters work on RGBA byte buffers so they can run on any image the
//! extractor produces.

use tracing::debug;

/// Lowest threshold the adaptive binarizer will pick
pub const MIN_THRESHOLD: f32 = 120.0;
/// Highest threshold the adaptive binarizer will pick
pub const MAX_THRESHOLD: f32 = 200.0;
/// Distance below mean luminance used as the threshold
pub const THRESHOLD_OFFSET: f32 = 20.0;

/// Standard luminance weights
#[inline]
pub fn luminance(r: u8, g: u8, b: u8) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

/// Mean luminance over every pixel of RGBA data (255 for an empty buffer)
pub fn mean_luminance(data: &[u8]) -> f32 {
    let mut total = 0.0f64;
    let mut count = 0usize;
    for chunk in data.chunks_exact(4) {
        total += luminance(chunk[0], chunk[1], chunk[2]) as f64;
        count += 1;
    }
    if count == 0 {
        return 255.0;
    }
    (total / count as f64) as f32
}

/// Threshold derived from mean luminance, always within [120, 200]
pub fn adaptive_threshold(mean_luminance: f32) -> f32 {
    (mean_luminance - THRESHOLD_OFFSET).clamp(MIN_THRESHOLD, MAX_THRESHOLD)
}

/// Binarize RGBA data in place: luminance below `threshold` becomes black,
/// everything else white. Returns the number of black pixels.
pub fn apply_binarize(data: &mut [u8], threshold: f32) -> usize {
    let mut black = 0;
    for chunk in data.chunks_exact_mut(4) {
        let value = if luminance(chunk[0], chunk[1], chunk[2]) < threshold {
            black += 1;
            0
        } else {
            255
        };
        chunk[0] = value;
        chunk[1] = value;
        chunk[2] = value;
        chunk[3] = 255;
    }
    black
}

/// Adaptive binarization: threshold from the mean, then binarize in place
///
/// Returns (threshold, black pixel count).
pub fn apply_adaptive_binarize(data: &mut [u8]) -> (f32, usize) {
    let threshold = adaptive_threshold(mean_luminance(data));
    let black = apply_binarize(data, threshold);
    debug!("Binarized with threshold {:.1}: {} black pixels", threshold, black);
    (threshold, black)
}
