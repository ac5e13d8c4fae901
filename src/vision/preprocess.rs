//! Tensor preparation for the recognition model
//!
//! Handles resizing, normalization, and NCHW conversion for the PaddleOCR
//! CRNN recognizer. The extractor already cropped to a single line of ink,
//! so the whole bitmap becomes one recognizer input.

use image::imageops::FilterType;
use image::RgbaImage;
use ndarray::{Array3, Array4};

/// Recognizer input configuration
#[derive(Debug, Clone)]
pub struct RecognizerInputConfig {
    /// Fixed input height expected by the model
    pub target_height: u32,
    /// Inputs wider than this are squeezed horizontally
    pub max_width: u32,
    /// Narrow inputs are right-padded to this width
    pub min_width: u32,
    /// Mean values for normalization [R, G, B]
    pub mean: [f32; 3],
    /// Std values for normalization [R, G, B]
    pub std: [f32; 3],
}

impl Default for RecognizerInputConfig {
    fn default() -> Self {
        Self {
            target_height: 48,
            max_width: 640,
            min_width: 96,
            // (pixel / 255 - 0.5) / 0.5 maps [0, 255] to [-1, 1]
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
        }
    }
}

/// Convert RGBA image data to an HWC array scaled to 0-1
pub fn rgba_to_rgb_f32(image: &RgbaImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| {
        image.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
    })
}

/// Normalize an HWC image in place with per-channel mean and std
pub fn normalize(image: &mut Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) {
    for ((_, _, c), value) in image.indexed_iter_mut() {
        *value = (*value - mean[c]) / std[c];
    }
}

/// Convert HWC image to NCHW tensor (batch size 1)
pub fn hwc_to_nchw(image: &Array3<f32>) -> Array4<f32> {
    let (h, w, c) = image.dim();
    Array4::from_shape_fn((1, c, h, w), |(_, ch, y, x)| image[[y, x, ch]])
}

/// Width after scaling to the target height, within the configured bounds
pub fn recognizer_width(width: u32, height: u32, config: &RecognizerInputConfig) -> u32 {
    if height == 0 {
        return config.min_width;
    }
    let scale = config.target_height as f32 / height as f32;
    ((width as f32 * scale).round() as u32).clamp(1, config.max_width)
}

/// Full preprocessing pipeline for the recognizer
///
/// Resizes to the fixed height, pads narrow inputs with white, normalizes and
/// returns an NCHW tensor.
pub fn preprocess_for_recognition(image: &RgbaImage, config: &RecognizerInputConfig) -> Array4<f32> {
    let new_w = recognizer_width(image.width(), image.height(), config);
    let resized = image::imageops::resize(image, new_w, config.target_height, FilterType::Triangle);

    let padded_w = new_w.max(config.min_width);
    let mut rgb = Array3::<f32>::ones((config.target_height as usize, padded_w as usize, 3));
    let scaled = rgba_to_rgb_f32(&resized);
    let ink_w = new_w as usize;
    rgb.slice_mut(ndarray::s![.., ..ink_w, ..]).assign(&scaled);

    normalize(&mut rgb, &config.mean, &config.std);
    hwc_to_nchw(&rgb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_rgba_to_rgb() {
        let mut image = RgbaImage::new(2, 1);
        image.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        image.put_pixel(1, 0, Rgba([0, 255, 0, 255]));

        let rgb = rgba_to_rgb_f32(&image);

        assert!((rgb[[0, 0, 0]] - 1.0).abs() < 0.01);
        assert!(rgb[[0, 0, 1]].abs() < 0.01);
        assert!(rgb[[0, 1, 0]].abs() < 0.01);
        assert!((rgb[[0, 1, 1]] - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_hwc_to_nchw() {
        let hwc = Array3::<f32>::from_shape_fn((10, 20, 3), |(h, w, c)| (h * 100 + w * 10 + c) as f32);

        let nchw = hwc_to_nchw(&hwc);

        assert_eq!(nchw.dim(), (1, 3, 10, 20));
        assert_eq!(nchw[[0, 1, 5, 10]], hwc[[5, 10, 1]]);
    }

    #[test]
    fn test_normalize_maps_to_unit_range() {
        let mut image = Array3::<f32>::from_elem((1, 2, 3), 1.0);
        image[[0, 1, 0]] = 0.0;
        normalize(&mut image, &[0.5; 3], &[0.5; 3]);
        assert!((image[[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((image[[0, 1, 0]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_recognizer_width_bounds() {
        let config = RecognizerInputConfig::default();
        // 300x100 at height 48 -> 144 wide
        assert_eq!(recognizer_width(300, 100, &config), 144);
        // very wide inputs are capped
        assert_eq!(recognizer_width(10_000, 100, &config), 640);
    }

    #[test]
    fn test_preprocess_shape_and_padding() {
        let config = RecognizerInputConfig::default();
        let image = RgbaImage::from_pixel(40, 96, Rgba([0, 0, 0, 255]));

        let tensor = preprocess_for_recognition(&image, &config);

        // 40x96 -> 20x48, padded to min width 96
        assert_eq!(tensor.dim(), (1, 3, 48, 96));
        // ink region is black (-1), padding is white (+1)
        assert!((tensor[[0, 0, 10, 5]] + 1.0).abs() < 1e-3);
        assert!((tensor[[0, 0, 10, 90]] - 1.0).abs() < 1e-3);
    }
}
