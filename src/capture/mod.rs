//! Stroke Capture Layer
//!
//! Records pointer input into immutable finalized strokes and owns the
//! undo/redo stacks. Input that fails gating (palm contact, edge touches,
//! taps) is dropped silently.

pub mod debounce;
pub mod stroke;

pub use debounce::{AutoRecognizeTimer, InFlightGuard, RecognizeTrigger};
pub use stroke::{CanvasSize, PointerKind, Stroke, StrokePoint};

use std::sync::Arc;
use tracing::debug;

use crate::config::CaptureSettings;

/// Stroke being drawn, not yet finalized
#[derive(Debug)]
struct PendingStroke {
    points: Vec<StrokePoint>,
    origin: StrokePoint,
    /// Set once accumulated movement passes the commit threshold
    committed: bool,
}

/// Pointer input recorder with undo/redo history
pub struct StrokeCapture {
    settings: CaptureSettings,
    canvas: CanvasSize,
    pending: Option<PendingStroke>,
    history: Vec<Stroke>,
    redo_stack: Vec<Stroke>,
    auto_recognize: Option<Arc<AutoRecognizeTimer>>,
}

impl StrokeCapture {
    /// Create a capture surface for a canvas of the given logical size
    pub fn new(settings: CaptureSettings, canvas: CanvasSize) -> Self {
        Self {
            settings,
            canvas,
            pending: None,
            history: Vec::new(),
            redo_stack: Vec::new(),
            auto_recognize: None,
        }
    }

    /// Attach the auto-recognition timer reset by every input event
    pub fn with_auto_recognize(mut self, timer: Arc<AutoRecognizeTimer>) -> Self {
        self.auto_recognize = Some(timer);
        self
    }

    pub fn canvas(&self) -> CanvasSize {
        self.canvas
    }

    /// Resize the canvas (e.g., orientation change); strokes are kept
    pub fn set_canvas(&mut self, canvas: CanvasSize) {
        self.canvas = canvas;
    }

    /// Start a stroke if the point passes input gating
    pub fn begin(&mut self, point: StrokePoint, pointer: PointerKind) {
        self.cancel_auto_recognize();

        if self.settings.stylus_only {
            if pointer != PointerKind::Pen {
                debug!("Dropping {:?} contact in stylus-only mode", pointer);
                self.pending = None;
                return;
            }
            if point.pressure <= 0.0 {
                debug!("Dropping pen contact without pressure");
                self.pending = None;
                return;
            }
        }

        if self.in_dead_zone(&point) {
            debug!("Dropping stroke starting in edge dead zone at ({}, {})", point.x, point.y);
            self.pending = None;
            return;
        }

        self.pending = Some(PendingStroke {
            points: vec![point],
            origin: point,
            committed: false,
        });
    }

    /// Append a point to the stroke being drawn
    pub fn extend(&mut self, point: StrokePoint) {
        self.cancel_auto_recognize();

        let threshold = self.settings.min_movement_px;
        let Some(pending) = self.pending.as_mut() else {
            return;
        };

        pending.points.push(point);
        if !pending.committed && pending.origin.distance_to(&point) >= threshold {
            pending.committed = true;
        }
    }

    /// Finalize the stroke being drawn
    ///
    /// Returns the finalized stroke, or `None` when it never committed.
    pub fn end(&mut self) -> Option<&Stroke> {
        let pending = self.pending.take()?;

        if !pending.committed {
            debug!("Dropping stroke below movement threshold ({} points)", pending.points.len());
            return None;
        }

        self.history.push(Stroke::new(pending.points));
        self.redo_stack.clear();
        self.arm_auto_recognize();
        self.history.last()
    }

    /// Keyboard input on the form also counts as activity
    pub fn key_input(&mut self) {
        self.arm_auto_recognize();
    }

    /// Move the last finished stroke onto the redo stack
    pub fn undo(&mut self) -> bool {
        self.cancel_auto_recognize();
        match self.history.pop() {
            Some(stroke) => {
                self.redo_stack.push(stroke);
                true
            }
            None => false,
        }
    }

    /// Restore the most recently undone stroke
    pub fn redo(&mut self) -> bool {
        self.cancel_auto_recognize();
        match self.redo_stack.pop() {
            Some(stroke) => {
                self.history.push(stroke);
                true
            }
            None => false,
        }
    }

    /// Drop every stroke, pending input and redo entry
    pub fn clear(&mut self) {
        self.cancel_auto_recognize();
        self.pending = None;
        self.history.clear();
        self.redo_stack.clear();
    }

    /// Finalized strokes in drawing order
    pub fn strokes(&self) -> &[Stroke] {
        &self.history
    }

    /// Hand the finalized strokes to extraction
    pub fn snapshot(&self) -> Vec<Stroke> {
        self.history.clone()
    }

    pub fn can_undo(&self) -> bool {
        !self.history.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn is_drawing(&self) -> bool {
        self.pending.is_some()
    }

    fn in_dead_zone(&self, point: &StrokePoint) -> bool {
        let zone = self.settings.edge_dead_zone_px;
        point.x < zone
            || point.y < zone
            || point.x > self.canvas.width - zone
            || point.y > self.canvas.height - zone
    }

    fn cancel_auto_recognize(&self) {
        if let Some(timer) = &self.auto_recognize {
            timer.cancel();
        }
    }

    fn arm_auto_recognize(&self) {
        if let Some(timer) = &self.auto_recognize {
            timer.arm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> StrokeCapture {
        StrokeCapture::new(CaptureSettings::default(), CanvasSize::new(400.0, 200.0))
    }

    fn pt(x: f32, y: f32) -> StrokePoint {
        StrokePoint::new(x, y, 0.5, 0)
    }

    fn draw_line(capture: &mut StrokeCapture, from: (f32, f32), to: (f32, f32)) -> bool {
        capture.begin(pt(from.0, from.1), PointerKind::Touch);
        capture.extend(pt((from.0 + to.0) / 2.0, (from.1 + to.1) / 2.0));
        capture.extend(pt(to.0, to.1));
        capture.end().is_some()
    }

    #[test]
    fn test_stroke_is_recorded() {
        let mut capture = capture();
        assert!(draw_line(&mut capture, (50.0, 50.0), (80.0, 60.0)));
        assert_eq!(capture.strokes().len(), 1);
        assert_eq!(capture.strokes()[0].len(), 3);
        assert!(!capture.is_drawing());
    }

    #[test]
    fn test_tap_is_dropped() {
        let mut capture = capture();
        capture.begin(pt(50.0, 50.0), PointerKind::Touch);
        capture.extend(pt(51.0, 51.0));
        assert!(capture.end().is_none());
        assert!(capture.strokes().is_empty());
    }

    #[test]
    fn test_edge_dead_zone_drops_stroke() {
        let mut capture = capture();
        assert!(!draw_line(&mut capture, (3.0, 50.0), (80.0, 60.0)));
        assert!(!draw_line(&mut capture, (395.0, 50.0), (300.0, 60.0)));
        assert!(capture.strokes().is_empty());
    }

    #[test]
    fn test_stylus_only_requires_pressure() {
        let settings = CaptureSettings {
            stylus_only: true,
            ..Default::default()
        };
        let mut capture = StrokeCapture::new(settings, CanvasSize::new(400.0, 200.0));

        capture.begin(StrokePoint::new(50.0, 50.0, 0.0, 0), PointerKind::Pen);
        capture.extend(pt(90.0, 90.0));
        assert!(capture.end().is_none());

        capture.begin(StrokePoint::new(50.0, 50.0, 0.3, 0), PointerKind::Pen);
        capture.extend(pt(90.0, 90.0));
        assert!(capture.end().is_some());
    }

    #[test]
    fn test_stylus_only_rejects_touch_and_mouse() {
        let settings = CaptureSettings {
            stylus_only: true,
            ..Default::default()
        };
        let mut capture = StrokeCapture::new(settings, CanvasSize::new(400.0, 200.0));

        for pointer in [PointerKind::Touch, PointerKind::Mouse] {
            capture.begin(pt(50.0, 50.0), pointer);
            capture.extend(pt(90.0, 90.0));
            assert!(capture.end().is_none());
        }
        assert!(capture.strokes().is_empty());
    }

    #[test]
    fn test_extend_without_begin_is_ignored() {
        let mut capture = capture();
        capture.extend(pt(60.0, 60.0));
        assert!(capture.end().is_none());
        assert!(capture.strokes().is_empty());
    }

    #[test]
    fn test_undo_redo() {
        let mut capture = capture();
        draw_line(&mut capture, (50.0, 50.0), (80.0, 60.0));
        draw_line(&mut capture, (100.0, 50.0), (130.0, 60.0));
        let second_id = capture.strokes()[1].id().to_string();

        assert!(capture.undo());
        assert_eq!(capture.strokes().len(), 1);
        assert!(capture.can_redo());

        assert!(capture.redo());
        assert_eq!(capture.strokes().len(), 2);
        assert_eq!(capture.strokes()[1].id(), second_id);
        assert!(!capture.redo());
    }

    #[test]
    fn test_new_stroke_clears_redo() {
        let mut capture = capture();
        draw_line(&mut capture, (50.0, 50.0), (80.0, 60.0));
        capture.undo();
        assert!(capture.can_redo());

        draw_line(&mut capture, (100.0, 50.0), (130.0, 60.0));
        assert!(!capture.can_redo());
    }

    #[test]
    fn test_undo_on_empty_history() {
        let mut capture = capture();
        assert!(!capture.undo());
    }

    #[test]
    fn test_clear() {
        let mut capture = capture();
        draw_line(&mut capture, (50.0, 50.0), (80.0, 60.0));
        capture.undo();
        draw_line(&mut capture, (50.0, 50.0), (80.0, 60.0));
        capture.clear();
        assert!(!capture.can_undo());
        assert!(!capture.can_redo());
    }

    #[tokio::test]
    async fn test_input_cancels_auto_recognize() {
        let timer = Arc::new(AutoRecognizeTimer::new(
            std::time::Duration::from_secs(60),
            Arc::new(|| {}),
        ));
        let mut capture = capture().with_auto_recognize(timer.clone());

        draw_line(&mut capture, (50.0, 50.0), (80.0, 60.0));
        assert!(timer.is_armed());

        capture.begin(pt(100.0, 100.0), PointerKind::Touch);
        assert!(!timer.is_armed());
    }
}
