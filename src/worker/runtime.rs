//! Worker thread body
//!
//! Owns the engines for the lifetime of the thread and serializes every
//! engine call. Requests are handled strictly in arrival order.

use crossbeam_channel::{Receiver, Sender};
use image::RgbaImage;
use tracing::{debug, info, warn};

use super::protocol::{EngineOutputs, WorkerFailure, WorkerRequest, WorkerResponse};
use crate::vision::{
    BoundingBox, EngineAdapter, EngineKind, EngineSet, RecognitionMode, RecognitionOptions, RecognitionToken,
};

/// State living on the worker thread
pub struct WorkerRuntime {
    engines: EngineSet,
    initialized: bool,
    /// Route `auto` to the remote engine (resource-constrained device)
    prefer_backend: bool,
}

impl WorkerRuntime {
    pub fn new(engines: EngineSet, prefer_backend: bool) -> Self {
        Self {
            engines,
            initialized: false,
            prefer_backend,
        }
    }

    /// Serve requests until `Destroy` or until the host hangs up
    pub fn run(mut self, requests: Receiver<WorkerRequest>, responses: Sender<WorkerResponse>) {
        info!("Recognition worker started");

        for request in requests.iter() {
            let id = request.id();
            let stop = matches!(request, WorkerRequest::Destroy { .. });

            let response = self.handle(request, &responses);
            if responses.send(response).is_err() {
                debug!("Host dropped the response channel");
                break;
            }
            if stop {
                debug!("Destroy request {} handled", id);
                break;
            }
        }

        info!("Recognition worker stopped");
    }

    fn ensure_initialized(&mut self) {
        if !self.initialized {
            let failures = self.engines.init_all();
            if !failures.is_empty() {
                info!("{} engine(s) unavailable after init", failures.len());
            }
            self.initialized = true;
        }
    }

    fn handle(&mut self, request: WorkerRequest, responses: &Sender<WorkerResponse>) -> WorkerResponse {
        match request {
            WorkerRequest::Init { id } => {
                self.ensure_initialized();
                WorkerResponse::Success {
                    id,
                    result: EngineOutputs::default(),
                }
            }
            WorkerRequest::Warmup { id } => {
                self.ensure_initialized();
                self.engines.warmup_all();
                WorkerResponse::Success {
                    id,
                    result: EngineOutputs::default(),
                }
            }
            WorkerRequest::Recognize { id, payload } => {
                self.ensure_initialized();
                let image = match image::load_from_memory(&payload.image_bytes) {
                    Ok(image) => image.to_rgba8(),
                    Err(e) => {
                        return WorkerResponse::Error {
                            id,
                            error: WorkerFailure::BadImage { message: e.to_string() },
                        }
                    }
                };
                match self.recognize(id, &image, &payload.options, responses) {
                    Ok(result) => WorkerResponse::Success { id, result },
                    Err(error) => WorkerResponse::Error { id, error },
                }
            }
            WorkerRequest::Destroy { id } => WorkerResponse::Success {
                id,
                result: EngineOutputs::default(),
            },
        }
    }

    /// Mode actually used for a request
    pub fn effective_mode(&self, requested: RecognitionMode) -> RecognitionMode {
        if requested == RecognitionMode::Auto && self.prefer_backend && self.engines.has_remote() {
            RecognitionMode::Backend
        } else {
            requested
        }
    }

    fn recognize(
        &mut self,
        id: u64,
        image: &RgbaImage,
        options: &RecognitionOptions,
        responses: &Sender<WorkerResponse>,
    ) -> Result<EngineOutputs, WorkerFailure> {
        let mode = self.effective_mode(options.mode);
        if mode != options.mode {
            debug!("Request {} routed to the remote engine", id);
        }

        let full = BoundingBox::new(0.0, 0.0, image.width() as f32, image.height() as f32);
        let regions = if options.regions_of_interest.is_empty() {
            vec![full]
        } else {
            options.regions_of_interest.clone()
        };

        let mut outputs = EngineOutputs::default();
        let total = regions.len();
        for (index, region) in regions.iter().enumerate() {
            let Some((crop, x, y)) = crop_region(image, region) else {
                debug!("Skipping empty region {:?}", region);
                continue;
            };

            let region_outputs = self.dispatch(mode, &crop, options)?;
            outputs
                .text
                .extend(region_outputs.text.into_iter().map(|t| offset_token(t, x, y)));
            outputs
                .digit
                .extend(region_outputs.digit.into_iter().map(|t| offset_token(t, x, y)));

            if total > 1 {
                let _ = responses.send(WorkerResponse::Progress {
                    id,
                    progress: (index + 1) as f32 / total as f32,
                });
            }
        }

        Ok(outputs)
    }

    /// Run the engines for one bitmap with the local→local→remote fallback
    fn dispatch(
        &mut self,
        mode: RecognitionMode,
        image: &RgbaImage,
        options: &RecognitionOptions,
    ) -> Result<EngineOutputs, WorkerFailure> {
        let mut failures = Vec::new();

        if mode == RecognitionMode::Backend {
            return match run_remote(&mut self.engines, image, options, &mut failures) {
                Some(tokens) => Ok(EngineOutputs {
                    text: tokens,
                    digit: Vec::new(),
                }),
                None => Err(WorkerFailure::Engine { failures }),
            };
        }

        let requested: &[EngineKind] = match mode {
            RecognitionMode::Text => &[EngineKind::Text],
            RecognitionMode::Digit => &[EngineKind::Digit],
            _ => &[EngineKind::Text, EngineKind::Digit],
        };

        let mut outputs = EngineOutputs::default();
        let mut succeeded = run_local(&mut self.engines, requested, image, options, &mut outputs, &mut failures);

        // Requested engines all failed: try the remaining local engines
        if !succeeded {
            let rest: Vec<EngineKind> = [EngineKind::Text, EngineKind::Digit]
                .into_iter()
                .filter(|k| !requested.contains(k))
                .collect();
            succeeded = run_local(&mut self.engines, &rest, image, options, &mut outputs, &mut failures);
        }

        if !outputs.is_empty() {
            return Ok(outputs);
        }

        if self.engines.has_remote() {
            if let Some(tokens) = run_remote(&mut self.engines, image, options, &mut failures) {
                outputs.text = tokens;
                return Ok(outputs);
            }
        }

        // Empty output only counts as an answer when no engine failed
        if succeeded && failures.is_empty() {
            Ok(outputs)
        } else {
            if failures.is_empty() {
                failures.push("no recognition engine available".to_string());
            }
            Err(WorkerFailure::Engine { failures })
        }
    }
}

fn engine_slot(engines: &mut EngineSet, kind: EngineKind) -> Option<&mut Box<dyn EngineAdapter>> {
    match kind {
        EngineKind::Text => engines.text.as_mut(),
        EngineKind::Digit => engines.digit.as_mut(),
        EngineKind::Remote => engines.remote.as_mut(),
    }
}

/// Run local engines in order; returns whether any of them succeeded
fn run_local(
    engines: &mut EngineSet,
    kinds: &[EngineKind],
    image: &RgbaImage,
    options: &RecognitionOptions,
    outputs: &mut EngineOutputs,
    failures: &mut Vec<String>,
) -> bool {
    let mut succeeded = false;

    for &kind in kinds {
        let Some(engine) = engine_slot(engines, kind) else {
            continue;
        };
        if !engine.is_ready() {
            failures.push(format!("{}: not available", engine.name()));
            continue;
        }

        match engine.recognize(image, options) {
            Ok(tokens) => {
                debug!("Engine {} returned {} tokens", engine.name(), tokens.len());
                succeeded = true;
                match kind {
                    EngineKind::Digit => outputs.digit.extend(tokens),
                    _ => outputs.text.extend(tokens),
                }
            }
            Err(e) => {
                warn!("Engine {} failed, trying next: {:#}", engine.name(), e);
                failures.push(format!("{}: {:#}", engine.name(), e));
            }
        }
    }

    succeeded
}

fn run_remote(
    engines: &mut EngineSet,
    image: &RgbaImage,
    options: &RecognitionOptions,
    failures: &mut Vec<String>,
) -> Option<Vec<RecognitionToken>> {
    let Some(engine) = engines.remote.as_mut() else {
        failures.push("remote: no endpoint configured".to_string());
        return None;
    };

    if !engine.is_ready() {
        failures.push(format!("{}: not available", engine.name()));
        return None;
    }

    match engine.recognize(image, options) {
        Ok(tokens) => Some(tokens),
        Err(e) => {
            warn!("Remote engine failed: {:#}", e);
            failures.push(format!("{}: {:#}", engine.name(), e));
            None
        }
    }
}

/// Crop a region clamped to the image; returns the crop and its origin
fn crop_region(image: &RgbaImage, region: &BoundingBox) -> Option<(RgbaImage, f32, f32)> {
    let x0 = region.x.max(0.0).floor() as u32;
    let y0 = region.y.max(0.0).floor() as u32;
    let x1 = (region.right().ceil().max(0.0) as u32).min(image.width());
    let y1 = (region.bottom().ceil().max(0.0) as u32).min(image.height());
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    let crop = image::imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
    Some((crop, x0 as f32, y0 as f32))
}

fn offset_token(mut token: RecognitionToken, x: f32, y: f32) -> RecognitionToken {
    token.bounding_box = token.bounding_box.unscale(x, y, 1.0);
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::engine::testing::ScriptedEngine;
    use crate::vision::{DigitEngine, RecognitionRequest, SourceEngine};
    use crossbeam_channel::unbounded;
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, image::Rgba([255, 255, 255, 255]));
        let mut buf = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn tok(text: &str, confidence: f32, source: SourceEngine) -> RecognitionToken {
        RecognitionToken::new(text, confidence, BoundingBox::new(10.0, 10.0, 50.0, 30.0), source)
    }

    fn recognize(runtime: &mut WorkerRuntime, options: RecognitionOptions) -> WorkerResponse {
        let (tx, _rx) = unbounded();
        runtime.handle(
            WorkerRequest::Recognize {
                id: 1,
                payload: RecognitionRequest {
                    image_bytes: png(300, 100),
                    options,
                    request_id: "r".into(),
                },
            },
            &tx,
        )
    }

    fn text_engine(tokens: Vec<RecognitionToken>) -> Box<dyn EngineAdapter> {
        Box::new(ScriptedEngine::new("text", EngineKind::Text).with_tokens(tokens))
    }

    fn digit_engine(tokens: Vec<RecognitionToken>) -> Box<dyn EngineAdapter> {
        Box::new(ScriptedEngine::new("digit", EngineKind::Digit).with_tokens(tokens))
    }

    fn remote_engine(tokens: Vec<RecognitionToken>) -> Box<dyn EngineAdapter> {
        Box::new(ScriptedEngine::new("remote", EngineKind::Remote).with_tokens(tokens))
    }

    #[test]
    fn test_auto_runs_all_local_engines() {
        let engines = EngineSet::new()
            .with_text(text_engine(vec![tok("500", 0.82, SourceEngine::Text)]))
            .with_digit(digit_engine(vec![tok("500", 0.91, SourceEngine::Digit)]))
            .with_remote(remote_engine(vec![tok("remote", 0.5, SourceEngine::Remote)]));
        let mut runtime = WorkerRuntime::new(engines, false);

        match recognize(&mut runtime, RecognitionOptions::default()) {
            WorkerResponse::Success { result, .. } => {
                assert_eq!(result.text.len(), 1);
                assert_eq!(result.digit.len(), 1);
                assert_eq!(result.text[0].text, "500");
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_text_mode_skips_digit_engine() {
        let digit = ScriptedEngine::new("digit", EngineKind::Digit);
        let digit_calls = digit.calls.clone();
        let engines = EngineSet::new()
            .with_text(text_engine(vec![tok("abc", 0.9, SourceEngine::Text)]))
            .with_digit(Box::new(digit));
        let mut runtime = WorkerRuntime::new(engines, false);

        let response = recognize(&mut runtime, RecognitionOptions::default().with_mode(RecognitionMode::Text));
        assert!(matches!(response, WorkerResponse::Success { .. }));
        assert_eq!(digit_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_local_falls_back_to_remote() {
        let engines = EngineSet::new()
            .with_text(Box::new(ScriptedEngine::new("text", EngineKind::Text).with_failure("onnx exploded")))
            .with_digit(Box::new(ScriptedEngine::new("digit", EngineKind::Digit).with_failure("no model")))
            .with_remote(remote_engine(vec![tok("₹500", 0.7, SourceEngine::Remote)]));
        let mut runtime = WorkerRuntime::new(engines, false);

        match recognize(&mut runtime, RecognitionOptions::default()) {
            WorkerResponse::Success { result, .. } => {
                assert_eq!(result.text[0].text, "₹500");
                assert_eq!(result.text[0].source_engine, SourceEngine::Remote);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_exhausted_chain_reports_every_failure() {
        let engines = EngineSet::new()
            .with_text(Box::new(ScriptedEngine::new("text", EngineKind::Text).with_failure("onnx exploded")))
            .with_digit(Box::new(ScriptedEngine::new("digit", EngineKind::Digit).unavailable()))
            .with_remote(Box::new(
                ScriptedEngine::new("remote", EngineKind::Remote).with_failure("HTTP 503"),
            ));
        let mut runtime = WorkerRuntime::new(engines, false);

        match recognize(&mut runtime, RecognitionOptions::default()) {
            WorkerResponse::Error {
                error: WorkerFailure::Engine { failures },
                ..
            } => {
                assert_eq!(failures.len(), 3);
                assert!(failures[0].contains("onnx exploded"));
                assert!(failures[1].contains("not available"));
                assert!(failures[2].contains("HTTP 503"));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_text_mode_falls_back_to_other_local_engine() {
        let engines = EngineSet::new()
            .with_text(Box::new(ScriptedEngine::new("text", EngineKind::Text).with_failure("boom")))
            .with_digit(digit_engine(vec![tok("42", 0.9, SourceEngine::Digit)]));
        let mut runtime = WorkerRuntime::new(engines, false);

        match recognize(&mut runtime, RecognitionOptions::default().with_mode(RecognitionMode::Text)) {
            WorkerResponse::Success { result, .. } => assert_eq!(result.digit[0].text, "42"),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_text_mode_failure_not_masked_by_empty_digit_engine() {
        let engines = EngineSet::new()
            .with_text(Box::new(ScriptedEngine::new("text", EngineKind::Text).with_failure("model missing")))
            .with_digit(Box::new(DigitEngine::new()));
        let mut runtime = WorkerRuntime::new(engines, false);

        match recognize(&mut runtime, RecognitionOptions::default().with_mode(RecognitionMode::Text)) {
            WorkerResponse::Error {
                error: WorkerFailure::Engine { failures },
                ..
            } => assert_eq!(failures, vec!["text: model missing".to_string()]),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_auto_mode_failure_not_masked_by_empty_digit_engine() {
        let engines = EngineSet::new()
            .with_text(Box::new(ScriptedEngine::new("text", EngineKind::Text).unavailable()))
            .with_digit(Box::new(DigitEngine::new()));
        let mut runtime = WorkerRuntime::new(engines, false);

        let response = recognize(&mut runtime, RecognitionOptions::default());
        assert!(matches!(
            response,
            WorkerResponse::Error {
                error: WorkerFailure::Engine { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_blank_image_with_healthy_engines_is_empty_success() {
        let engines = EngineSet::new()
            .with_text(text_engine(Vec::new()))
            .with_digit(Box::new(DigitEngine::new()));
        let mut runtime = WorkerRuntime::new(engines, false);

        match recognize(&mut runtime, RecognitionOptions::default()) {
            WorkerResponse::Success { result, .. } => assert!(result.is_empty()),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_backend_without_endpoint_errors() {
        let engines = EngineSet::new().with_text(text_engine(vec![tok("abc", 0.9, SourceEngine::Text)]));
        let mut runtime = WorkerRuntime::new(engines, false);

        match recognize(&mut runtime, RecognitionOptions::default().with_mode(RecognitionMode::Backend)) {
            WorkerResponse::Error {
                error: WorkerFailure::Engine { failures },
                ..
            } => assert!(failures[0].contains("no endpoint configured")),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_constrained_device_routes_auto_to_backend() {
        let text = ScriptedEngine::new("text", EngineKind::Text);
        let text_calls = text.calls.clone();
        let engines = EngineSet::new()
            .with_text(Box::new(text))
            .with_remote(remote_engine(vec![tok("hi", 0.8, SourceEngine::Remote)]));
        let mut runtime = WorkerRuntime::new(engines, true);

        assert_eq!(runtime.effective_mode(RecognitionMode::Auto), RecognitionMode::Backend);
        assert_eq!(runtime.effective_mode(RecognitionMode::Text), RecognitionMode::Text);
        let response = recognize(&mut runtime, RecognitionOptions::default());
        assert!(matches!(response, WorkerResponse::Success { .. }));
        assert_eq!(text_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_regions_map_back_to_image_coordinates() {
        let engines = EngineSet::new().with_text(text_engine(vec![tok("x", 0.9, SourceEngine::Text)]));
        let mut runtime = WorkerRuntime::new(engines, false);
        let options = RecognitionOptions {
            regions_of_interest: vec![
                BoundingBox::new(100.0, 20.0, 80.0, 60.0),
                BoundingBox::new(500.0, 500.0, 10.0, 10.0),
            ],
            ..Default::default()
        };

        let (tx, rx) = unbounded();
        let response = runtime.handle(
            WorkerRequest::Recognize {
                id: 3,
                payload: RecognitionRequest {
                    image_bytes: png(300, 100),
                    options,
                    request_id: "r".into(),
                },
            },
            &tx,
        );

        match response {
            WorkerResponse::Success { result, .. } => {
                // only the in-bounds region produced a token
                assert_eq!(result.text.len(), 1);
                assert_eq!(result.text[0].bounding_box, BoundingBox::new(110.0, 30.0, 50.0, 30.0));
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert!(rx.try_iter().all(|r| matches!(r, WorkerResponse::Progress { id: 3, .. })));
    }

    #[test]
    fn test_undecodable_image_is_rejected() {
        let mut runtime = WorkerRuntime::new(EngineSet::new(), false);
        let (tx, _rx) = unbounded();
        let response = runtime.handle(
            WorkerRequest::Recognize {
                id: 4,
                payload: RecognitionRequest {
                    image_bytes: b"definitely not a png".to_vec(),
                    options: RecognitionOptions::default(),
                    request_id: "r".into(),
                },
            },
            &tx,
        );
        assert!(matches!(
            response,
            WorkerResponse::Error {
                error: WorkerFailure::BadImage { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_run_loop_stops_on_destroy() {
        let (req_tx, req_rx) = unbounded();
        let (resp_tx, resp_rx) = unbounded();
        let handle = std::thread::spawn(move || WorkerRuntime::new(EngineSet::new(), false).run(req_rx, resp_tx));

        req_tx.send(WorkerRequest::Init { id: 1 }).unwrap();
        req_tx.send(WorkerRequest::Destroy { id: 2 }).unwrap();
        handle.join().unwrap();

        let ids: Vec<u64> = resp_rx.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
