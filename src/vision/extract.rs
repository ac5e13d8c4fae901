//! Stroke-to-bitmap extraction
//!
//! Crops to the ink, re-renders the strokes without the canvas grid at a
//! higher resolution, binarizes, and guarantees a minimum size the engines
//! can read.

use image::imageops::FilterType;
use image::{ImageFormat, Rgba, RgbaImage};
use imageproc::drawing::draw_filled_circle_mut;
use std::io::Cursor;
use tracing::{debug, info};

use super::ocr_preprocess::apply_adaptive_binarize;
use super::BoundingBox;
use crate::capture::{CanvasSize, Stroke};
use crate::config::ExtractionSettings;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Upscale applied to the raw render when binarization wipes out the ink
const FALLBACK_UPSCALE: u32 = 3;

/// Bitmap ready for recognition
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    /// Black ink on white
    pub image: RgbaImage,
    /// Canvas region the bitmap covers, in logical pixels
    pub crop: BoundingBox,
    /// Bitmap pixels per logical canvas pixel
    pub scale: f32,
    /// False when the faint-ink fallback kept the unbinarized render
    pub binarized: bool,
}

impl ExtractedImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Encode as PNG for the worker request
    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Vec::new();
        self.image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok(buf)
    }

    /// Map a box in bitmap pixels back to canvas coordinates
    pub fn to_canvas(&self, bounds: &BoundingBox) -> BoundingBox {
        bounds.unscale(self.crop.x, self.crop.y, self.scale)
    }
}

/// Tight box around every stroke point, padded and clamped to the canvas
///
/// `None` iff there are no points.
pub fn stroke_bounds(strokes: &[Stroke], canvas: CanvasSize, padding: f32) -> Option<BoundingBox> {
    let mut points = strokes.iter().flat_map(|s| s.points().iter()).peekable();
    points.peek()?;

    let (mut min_x, mut min_y) = (f32::INFINITY, f32::INFINITY);
    let (mut max_x, mut max_y) = (f32::NEG_INFINITY, f32::NEG_INFINITY);
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }

    let x0 = (min_x - padding).clamp(0.0, canvas.width);
    let y0 = (min_y - padding).clamp(0.0, canvas.height);
    let x1 = (max_x + padding).clamp(0.0, canvas.width);
    let y1 = (max_y + padding).clamp(0.0, canvas.height);

    Some(BoundingBox::new(x0, y0, x1 - x0, y1 - y0))
}

/// Turns finalized strokes into a clean, cropped, binarized bitmap
#[derive(Debug, Clone, Default)]
pub struct ImageExtractor {
    settings: ExtractionSettings,
}

impl ImageExtractor {
    pub fn new(settings: ExtractionSettings) -> Self {
        Self { settings }
    }

    /// Extract a recognizable bitmap; `None` when nothing was drawn
    pub fn extract(&self, strokes: &[Stroke], canvas: CanvasSize) -> Option<ExtractedImage> {
        let crop = stroke_bounds(strokes, canvas, self.settings.padding_px)?;
        let scale = self.settings.render_scale.max(2);

        let raw = self.render(strokes, &crop, scale);
        let (image, extra_scale, binarized) = self.binarize_or_fallback(raw);
        let (image, min_scale) = self.ensure_min_size(image);

        let total_scale = scale as f32 * extra_scale * min_scale;
        debug!(
            "Extracted {}x{} bitmap from {} strokes (scale {:.2}, binarized {})",
            image.width(),
            image.height(),
            strokes.len(),
            total_scale,
            binarized
        );

        Some(ExtractedImage {
            image,
            crop,
            scale: total_scale,
            binarized,
        })
    }

    /// Draw only the strokes, aliased, onto a fresh white bitmap
    fn render(&self, strokes: &[Stroke], crop: &BoundingBox, scale: u32) -> RgbaImage {
        let s = scale as f32;
        let width = ((crop.w * s).ceil() as u32).max(1);
        let height = ((crop.h * s).ceil() as u32).max(1);
        let mut img = RgbaImage::from_pixel(width, height, WHITE);

        let radius = ((self.settings.stroke_width_px * s) / 2.0).round().max(1.0) as i32;
        let to_px = |x: f32, y: f32| ((x - crop.x) * s, (y - crop.y) * s);

        for stroke in strokes {
            let points = stroke.points();
            if let [only] = points {
                let (x, y) = to_px(only.x, only.y);
                draw_filled_circle_mut(&mut img, (x.round() as i32, y.round() as i32), radius, BLACK);
                continue;
            }

            for segment in points.windows(2) {
                let (x0, y0) = to_px(segment[0].x, segment[0].y);
                let (x1, y1) = to_px(segment[1].x, segment[1].y);
                let steps = ((x1 - x0).hypot(y1 - y0).ceil() as usize).max(1);
                for i in 0..=steps {
                    let t = i as f32 / steps as f32;
                    let x = x0 + (x1 - x0) * t;
                    let y = y0 + (y1 - y0) * t;
                    draw_filled_circle_mut(&mut img, (x.round() as i32, y.round() as i32), radius, BLACK);
                }
            }
        }

        img
    }

    /// Adaptive binarization, falling back to a 3x upscale of the raw render
    /// when too little ink survives
    ///
    /// Returns (image, additional scale, binarized).
    pub fn binarize_or_fallback(&self, raw: RgbaImage) -> (RgbaImage, f32, bool) {
        let (width, height) = raw.dimensions();
        let mut data = raw.as_raw().clone();
        let (_, black) = apply_adaptive_binarize(&mut data);

        if black < self.settings.fallback_min_black_pixels {
            info!(
                "Only {} black pixels after binarization, keeping raw render at {}x",
                black, FALLBACK_UPSCALE
            );
            let image = image::imageops::resize(
                &raw,
                width * FALLBACK_UPSCALE,
                height * FALLBACK_UPSCALE,
                FilterType::Nearest,
            );
            return (image, FALLBACK_UPSCALE as f32, false);
        }

        match RgbaImage::from_raw(width, height, data) {
            Some(image) => (image, 1.0, true),
            None => (raw, 1.0, false),
        }
    }

    /// Nearest-neighbor upscale so the bitmap meets the minimum size
    ///
    /// Returns (image, applied scale).
    pub fn ensure_min_size(&self, image: RgbaImage) -> (RgbaImage, f32) {
        let (width, height) = image.dimensions();
        let min_w = self.settings.min_width;
        let min_h = self.settings.min_height;
        if width >= min_w && height >= min_h {
            return (image, 1.0);
        }

        let factor = (min_w as f32 / width as f32).max(min_h as f32 / height as f32);
        let new_w = ((width as f32 * factor).ceil() as u32).max(min_w);
        let new_h = ((height as f32 * factor).ceil() as u32).max(min_h);
        debug!("Upscaling {}x{} to {}x{} for minimum size", width, height, new_w, new_h);

        let resized = image::imageops::resize(&image, new_w, new_h, FilterType::Nearest);
        (resized, factor)
    }
}
