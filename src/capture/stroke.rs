//! Stroke data structures for captured pointer input

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single sampled pointer position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrokePoint {
    /// Canvas x in logical pixels
    pub x: f32,
    /// Canvas y in logical pixels
    pub y: f32,
    /// Normalized pressure (0.0 - 1.0); mice and fingers report 0.5
    pub pressure: f32,
    /// Sample time in epoch milliseconds
    pub timestamp_ms: i64,
}

impl StrokePoint {
    pub fn new(x: f32, y: f32, pressure: f32, timestamp_ms: i64) -> Self {
        Self {
            x,
            y,
            pressure,
            timestamp_ms,
        }
    }

    /// Euclidean distance to another point
    pub fn distance_to(&self, other: &StrokePoint) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Kind of pointer that produced the input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerKind {
    Pen,
    #[default]
    Touch,
    Mouse,
}

/// A finalized polyline from one continuous contact
///
/// Points are private so a finished stroke cannot be edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    id: String,
    points: Vec<StrokePoint>,
}

impl Stroke {
    /// Finalize a polyline; ordering of `points` is preserved
    pub fn new(points: Vec<StrokePoint>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            points,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn points(&self) -> &[StrokePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Canvas logical size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanvasSize {
    pub width: f32,
    pub height: f32,
}

impl CanvasSize {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance() {
        let a = StrokePoint::new(0.0, 0.0, 0.5, 0);
        let b = StrokePoint::new(3.0, 4.0, 0.5, 1);
        assert!((a.distance_to(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_stroke_preserves_order_and_has_id() {
        let points = vec![
            StrokePoint::new(1.0, 1.0, 0.5, 0),
            StrokePoint::new(2.0, 2.0, 0.5, 1),
        ];
        let stroke = Stroke::new(points.clone());
        assert_eq!(stroke.points(), points.as_slice());
        assert!(!stroke.id().is_empty());
        assert_ne!(stroke.id(), Stroke::new(points).id());
    }
}
