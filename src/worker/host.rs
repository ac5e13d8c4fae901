//! Host side of the recognition worker
//!
//! [`RecognitionService`] is built once at the composition root and cloned
//! into every call site. It spawns the worker thread lazily, correlates
//! responses by id, bounds every request with its own timeout task and
//! respawns the worker after a crash.
//!
//! Each pending entry is resolved by whoever removes it from the map: the
//! response dispatcher, the timeout task, or the crash sweep. A response for
//! an id that is no longer pending is dropped.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{EngineOutputs, WorkerFailure, WorkerRequest, WorkerResponse};
use super::runtime::WorkerRuntime;
use super::EngineFactory;
use crate::config::RecognitionSettings;
use crate::error::RecognitionError;
use crate::vision::{merge_results, RecognitionOptions, RecognitionRequest, RecognitionToken};

/// Default bound on a single worker round-trip
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Service tuning
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub timeout: Duration,
    /// Route `auto` requests to the remote engine
    pub prefer_backend: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            prefer_backend: false,
        }
    }
}

impl ServiceConfig {
    pub fn from_settings(settings: &RecognitionSettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            prefer_backend: super::is_resource_constrained(settings),
        }
    }
}

impl From<WorkerFailure> for RecognitionError {
    fn from(failure: WorkerFailure) -> Self {
        match failure {
            WorkerFailure::Engine { failures } => RecognitionError::Engine { failures },
            WorkerFailure::BadImage { message } => RecognitionError::Protocol {
                message: format!("worker could not decode image: {}", message),
            },
        }
    }
}

type Reply = Result<EngineOutputs, RecognitionError>;

struct Pending {
    reply: oneshot::Sender<Reply>,
    timer: Option<tokio::task::JoinHandle<()>>,
    /// Worker generation the request was sent to
    generation: u64,
}

impl Pending {
    fn settle(self, reply: Reply) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have stopped waiting
        let _ = self.reply.send(reply);
    }
}

struct WorkerHandle {
    requests: Sender<WorkerRequest>,
    generation: u64,
}

struct Shared {
    factory: EngineFactory,
    config: ServiceConfig,
    pending: Mutex<HashMap<u64, Pending>>,
    worker: Mutex<Option<WorkerHandle>>,
    next_id: AtomicU64,
    generation: AtomicU64,
    late_responses: AtomicU64,
    shut_down: AtomicBool,
}

impl Shared {
    /// Sender of the live worker, spawning one if needed
    fn worker_sender(self: &Arc<Self>) -> Result<(Sender<WorkerRequest>, u64), RecognitionError> {
        let mut worker = self.worker.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(RecognitionError::ShutDown);
        }
        if worker.is_none() {
            *worker = Some(self.spawn_worker()?);
        }
        match worker.as_ref() {
            Some(handle) => Ok((handle.requests.clone(), handle.generation)),
            None => Err(RecognitionError::ShutDown),
        }
    }

    fn spawn_worker(self: &Arc<Self>) -> Result<WorkerHandle, RecognitionError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        let (response_tx, response_rx) = crossbeam_channel::unbounded();

        let engines = (self.factory)();
        let prefer_backend = self.config.prefer_backend;
        let worker = std::thread::Builder::new()
            .name(format!("recognition-worker-{}", generation))
            .spawn(move || WorkerRuntime::new(engines, prefer_backend).run(request_rx, response_tx))
            .map_err(|e| RecognitionError::WorkerCrash {
                message: format!("failed to spawn worker thread: {}", e),
            })?;

        let shared = Arc::downgrade(self);
        std::thread::Builder::new()
            .name(format!("recognition-dispatch-{}", generation))
            .spawn(move || dispatch_responses(shared, response_rx, worker, generation))
            .map_err(|e| RecognitionError::WorkerCrash {
                message: format!("failed to spawn dispatcher thread: {}", e),
            })?;

        info!("Spawned recognition worker (generation {})", generation);
        Ok(WorkerHandle {
            requests: request_tx,
            generation,
        })
    }

    fn complete(&self, response: WorkerResponse) {
        match response {
            WorkerResponse::Progress { id, progress } => {
                debug!("Request {} progress {:.0}%", id, progress * 100.0);
            }
            WorkerResponse::Success { id, result } => self.resolve(id, Ok(result)),
            WorkerResponse::Error { id, error } => self.resolve(id, Err(error.into())),
        }
    }

    fn resolve(&self, id: u64, reply: Reply) {
        let entry = self.pending.lock().remove(&id);
        match entry {
            Some(pending) => pending.settle(reply),
            None => {
                self.late_responses.fetch_add(1, Ordering::SeqCst);
                debug!("Dropping late response for request {}", id);
            }
        }
    }

    /// Worker thread of `generation` is gone: reject its requests, forget it
    fn on_worker_exit(&self, generation: u64, message: String) {
        {
            let mut worker = self.worker.lock();
            if worker.as_ref().map(|w| w.generation) == Some(generation) {
                *worker = None;
            }
        }

        let orphaned: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.generation == generation)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        let shut_down = self.shut_down.load(Ordering::SeqCst);
        if !shut_down {
            warn!(
                "Recognition worker generation {} exited ({}); rejecting {} pending request(s)",
                generation,
                message,
                orphaned.len()
            );
        }

        for pending in orphaned {
            let error = if shut_down {
                RecognitionError::ShutDown
            } else {
                RecognitionError::WorkerCrash {
                    message: message.clone(),
                }
            };
            pending.settle(Err(error));
        }
    }

    fn reject_all(&self, make_error: impl Fn() -> RecognitionError) {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for pending in drained {
            pending.settle(Err(make_error()));
        }
    }
}

/// Drain worker responses until the worker exits
fn dispatch_responses(
    shared: Weak<Shared>,
    responses: Receiver<WorkerResponse>,
    worker: JoinHandle<()>,
    generation: u64,
) {
    for response in responses.iter() {
        match shared.upgrade() {
            Some(service) => service.complete(response),
            None => break,
        }
    }

    let message = match worker.join() {
        Ok(()) => "worker stopped".to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };

    if let Some(service) = shared.upgrade() {
        service.on_worker_exit(generation, message);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

async fn expire(shared: Weak<Shared>, id: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    let Some(service) = shared.upgrade() else {
        return;
    };
    let entry = service.pending.lock().remove(&id);
    if let Some(pending) = entry {
        warn!("Recognition request {} timed out after {:?}", id, timeout);
        let _ = pending.reply.send(Err(RecognitionError::WorkerTimeout {
            id,
            timeout_ms: timeout.as_millis() as u64,
        }));
    }
}

/// Handle to the recognition worker
#[derive(Clone)]
pub struct RecognitionService {
    shared: Arc<Shared>,
}

impl RecognitionService {
    /// Service whose workers get their engines from `factory`
    pub fn new(factory: EngineFactory, config: ServiceConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                config,
                pending: Mutex::new(HashMap::new()),
                worker: Mutex::new(None),
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                late_responses: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Service with the engines described by the settings
    pub fn from_settings(settings: &RecognitionSettings) -> Self {
        Self::new(super::engines_from_settings(settings), ServiceConfig::from_settings(settings))
    }

    /// Send one request and wait for its reply or its timeout
    async fn request(&self, build: impl FnOnce(u64) -> WorkerRequest) -> Reply {
        let shared = &self.shared;
        let (sender, generation) = shared.worker_sender()?;

        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        shared.pending.lock().insert(
            id,
            Pending {
                reply: reply_tx,
                timer: None,
                generation,
            },
        );

        let timer = tokio::spawn(expire(Arc::downgrade(shared), id, shared.config.timeout));
        if let Some(pending) = shared.pending.lock().get_mut(&id) {
            pending.timer = Some(timer);
        } else {
            timer.abort();
        }

        if sender.send(build(id)).is_err() {
            // Worker is already gone; the crash sweep may have run before we registered
            if let Some(pending) = shared.pending.lock().remove(&id) {
                pending.settle(Err(RecognitionError::WorkerCrash {
                    message: "worker is not accepting requests".to_string(),
                }));
            }
            let mut worker = shared.worker.lock();
            if worker.as_ref().map(|w| w.generation) == Some(generation) {
                *worker = None;
            }
        }

        match reply_rx.await {
            Ok(reply) => reply,
            Err(_) => Err(RecognitionError::WorkerCrash {
                message: "reply channel closed".to_string(),
            }),
        }
    }

    /// Start the worker and load engines
    pub async fn init(&self) -> Result<(), RecognitionError> {
        self.request(|id| WorkerRequest::Init { id }).await.map(|_| ())
    }

    /// Pay the cold-start cost up front
    pub async fn warmup(&self) -> Result<(), RecognitionError> {
        self.request(|id| WorkerRequest::Warmup { id }).await.map(|_| ())
    }

    /// Recognize a PNG and return fused tokens in reading order
    pub async fn recognize(
        &self,
        image_png: Vec<u8>,
        options: RecognitionOptions,
    ) -> Result<Vec<RecognitionToken>, RecognitionError> {
        let payload = RecognitionRequest {
            image_bytes: image_png,
            options,
            request_id: Uuid::new_v4().to_string(),
        };
        let outputs = self.request(|id| WorkerRequest::Recognize { id, payload }).await?;
        Ok(merge_results(outputs.text, outputs.digit))
    }

    /// Stop the worker; later calls fail with `ShutDown`
    pub async fn destroy(&self) {
        let shared = &self.shared;
        if shared.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let handle = shared.worker.lock().take();
        if let Some(handle) = handle {
            let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
            let (reply_tx, reply_rx) = oneshot::channel();
            shared.pending.lock().insert(
                id,
                Pending {
                    reply: reply_tx,
                    timer: None,
                    generation: handle.generation,
                },
            );
            if handle.requests.send(WorkerRequest::Destroy { id }).is_ok() {
                if tokio::time::timeout(shared.config.timeout, reply_rx).await.is_err() {
                    warn!("Worker did not acknowledge destroy within {:?}", shared.config.timeout);
                }
            }
        }

        shared.reject_all(|| RecognitionError::ShutDown);
        info!("Recognition service destroyed");
    }

    /// Requests still waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Responses that arrived after their request was settled
    pub fn late_responses(&self) -> u64 {
        self.shared.late_responses.load(Ordering::SeqCst)
    }

    /// How many workers have been spawned so far
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    pub fn is_worker_running(&self) -> bool {
        self.shared.worker.lock().is_some()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::engine::testing::ScriptedEngine;
    use crate::vision::{BoundingBox, EngineKind, EngineSet, SourceEngine};
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    fn png() -> Vec<u8> {
        let image = image::RgbaImage::from_pixel(300, 100, image::Rgba([255, 255, 255, 255]));
        let mut buf = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn token(text: &str, confidence: f32, source: SourceEngine) -> RecognitionToken {
        RecognitionToken::new(text, confidence, BoundingBox::new(20.0, 20.0, 120.0, 50.0), source)
    }

    fn config(timeout: Duration) -> ServiceConfig {
        ServiceConfig {
            timeout,
            prefer_backend: false,
        }
    }

    fn factory(build: impl Fn() -> EngineSet + Send + Sync + 'static) -> EngineFactory {
        Arc::new(build)
    }

    #[tokio::test]
    async fn test_recognize_fuses_engine_outputs() {
        let service = RecognitionService::new(
            factory(|| {
                EngineSet::new()
                    .with_text(Box::new(
                        ScriptedEngine::new("text", EngineKind::Text)
                            .with_tokens(vec![token("5OO", 0.82, SourceEngine::Text)]),
                    ))
                    .with_digit(Box::new(
                        ScriptedEngine::new("digit", EngineKind::Digit)
                            .with_tokens(vec![token("500", 0.91, SourceEngine::Digit)]),
                    ))
            }),
            config(DEFAULT_TIMEOUT),
        );

        let tokens = service.recognize(png(), RecognitionOptions::default()).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].text, "500");
        assert_eq!(tokens[0].source_engine, SourceEngine::Merged);
        assert_eq!(service.pending_count(), 0);
        assert_eq!(service.generation(), 1);
    }

    #[tokio::test]
    async fn test_worker_is_created_lazily_and_reused() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let counter = spawned.clone();
        let service = RecognitionService::new(
            factory(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                EngineSet::new().with_digit(Box::new(ScriptedEngine::new("digit", EngineKind::Digit)))
            }),
            config(DEFAULT_TIMEOUT),
        );

        assert!(!service.is_worker_running());
        service.warmup().await.unwrap();
        service.recognize(png(), RecognitionOptions::default()).await.unwrap();
        service.recognize(png(), RecognitionOptions::default()).await.unwrap();
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert!(service.is_worker_running());
    }

    #[tokio::test]
    async fn test_engine_failure_surfaces_aggregate() {
        let service = RecognitionService::new(
            factory(|| {
                EngineSet::new().with_text(Box::new(
                    ScriptedEngine::new("text", EngineKind::Text).with_failure("model missing"),
                ))
            }),
            config(DEFAULT_TIMEOUT),
        );

        let err = service
            .recognize(png(), RecognitionOptions::default())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        match err {
            RecognitionError::Engine { failures } => {
                assert_eq!(failures, vec!["text: model missing".to_string()]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_reject_once_and_never_leak() {
        // The engine blocks on the gate, so nothing is answered in time
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded::<()>();
        let service = RecognitionService::new(
            factory(move || {
                let gate = gate_rx.clone();
                EngineSet::new().with_digit(Box::new(GatedEngine { gate }))
            }),
            config(DEFAULT_TIMEOUT),
        );

        for _ in 0..1000 {
            let err = service
                .recognize(png(), RecognitionOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, RecognitionError::WorkerTimeout { timeout_ms: 10_000, .. }));
            assert!(err.is_retryable());
        }
        assert_eq!(service.pending_count(), 0);

        // Let the worker answer everything late; every answer is a map miss
        for _ in 0..1000 {
            gate_tx.send(()).unwrap();
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        while service.late_responses() < 1000 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(service.late_responses(), 1000);
        assert_eq!(service.pending_count(), 0);
        assert_eq!(service.generation(), 1);
    }

    #[tokio::test]
    async fn test_late_response_is_dropped() {
        let service = RecognitionService::new(
            factory(|| {
                EngineSet::new().with_digit(Box::new(
                    ScriptedEngine::new("digit", EngineKind::Digit).with_delay(Duration::from_millis(300)),
                ))
            }),
            config(Duration::from_millis(50)),
        );

        let err = service
            .recognize(png(), RecognitionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RecognitionError::WorkerTimeout { .. }));
        assert_eq!(service.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(service.late_responses(), 1);
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_crash_rejects_pending_and_respawns() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let counter = spawned.clone();
        let service = RecognitionService::new(
            factory(move || {
                let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
                let digit = ScriptedEngine::new("digit", EngineKind::Digit)
                    .with_tokens(vec![token("42", 0.9, SourceEngine::Digit)]);
                let digit = if first {
                    digit.with_delay(Duration::from_millis(100)).panicking()
                } else {
                    digit
                };
                EngineSet::new().with_digit(Box::new(digit))
            }),
            config(DEFAULT_TIMEOUT),
        );

        // Both requests are pending when the worker dies on the first one
        let (a, b) = tokio::join!(
            service.recognize(png(), RecognitionOptions::default()),
            service.recognize(png(), RecognitionOptions::default()),
        );
        for result in [a, b] {
            match result {
                Err(RecognitionError::WorkerCrash { message }) => assert!(message.contains("panicked")),
                other => panic!("expected crash, got {:?}", other),
            }
        }
        assert_eq!(service.pending_count(), 0);

        // Next call transparently respawns
        let tokens = service.recognize(png(), RecognitionOptions::default()).await.unwrap();
        assert_eq!(tokens[0].text, "42");
        assert_eq!(service.generation(), 2);
    }

    #[tokio::test]
    async fn test_destroy_shuts_down() {
        let service = RecognitionService::new(
            factory(|| EngineSet::new().with_digit(Box::new(ScriptedEngine::new("digit", EngineKind::Digit)))),
            config(DEFAULT_TIMEOUT),
        );
        service.init().await.unwrap();
        service.destroy().await;

        assert!(service.is_shut_down());
        assert!(!service.is_worker_running());
        assert!(matches!(
            service.recognize(png(), RecognitionOptions::default()).await,
            Err(RecognitionError::ShutDown)
        ));
        // Second destroy is a no-op
        service.destroy().await;
    }

    #[tokio::test]
    async fn test_bad_image_is_a_protocol_error() {
        let service = RecognitionService::new(
            factory(|| EngineSet::new().with_digit(Box::new(ScriptedEngine::new("digit", EngineKind::Digit)))),
            config(DEFAULT_TIMEOUT),
        );
        let err = service
            .recognize(b"nope".to_vec(), RecognitionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RecognitionError::Protocol { .. }));
    }

    /// Digit engine that answers only when the gate lets it through
    struct GatedEngine {
        gate: crossbeam_channel::Receiver<()>,
    }

    impl crate::vision::EngineAdapter for GatedEngine {
        fn name(&self) -> &str {
            "gated"
        }

        fn kind(&self) -> EngineKind {
            EngineKind::Digit
        }

        fn is_ready(&self) -> bool {
            true
        }

        fn init(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn recognize(
            &mut self,
            _image: &image::RgbaImage,
            _options: &RecognitionOptions,
        ) -> anyhow::Result<Vec<RecognitionToken>> {
            let _ = self.gate.recv();
            Ok(Vec::new())
        }
    }
}
