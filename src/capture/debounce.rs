//! Auto-recognition idle timer
//!
//! Every stroke or key input resets the timer. When it fires and no
//! recognition is in flight, the trigger callback runs once.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Callback invoked when the idle timer fires
pub type RecognizeTrigger = Arc<dyn Fn() + Send + Sync>;

/// Debounced auto-recognition timer
pub struct AutoRecognizeTimer {
    idle: Duration,
    in_flight: Arc<AtomicBool>,
    pending: Mutex<Option<CancellationToken>>,
    trigger: RecognizeTrigger,
}

impl AutoRecognizeTimer {
    /// Create a timer firing `trigger` after `idle` without input
    pub fn new(idle: Duration, trigger: RecognizeTrigger) -> Self {
        Self {
            idle,
            in_flight: Arc::new(AtomicBool::new(false)),
            pending: Mutex::new(None),
            trigger,
        }
    }

    /// Cancel the pending firing, if any
    pub fn cancel(&self) {
        if let Some(token) = self.pending.lock().take() {
            token.cancel();
        }
    }

    /// Restart the idle countdown
    ///
    /// Needs a tokio runtime; without one the timer stays disarmed.
    pub fn arm(&self) {
        self.cancel();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, auto-recognition not armed");
            return;
        };

        let token = CancellationToken::new();
        *self.pending.lock() = Some(token.clone());

        let idle = self.idle;
        let in_flight = self.in_flight.clone();
        let trigger = self.trigger.clone();
        handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(idle) => {
                    if in_flight.load(Ordering::SeqCst) {
                        debug!("Recognition already in flight, skipping auto-recognize");
                    } else {
                        trigger();
                    }
                }
            }
        });
    }

    /// Whether a countdown is currently running
    pub fn is_armed(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .map(|t| !t.is_cancelled())
            .unwrap_or(false)
    }

    /// Mark a recognition as running until the guard drops
    pub fn begin_recognition(&self) -> InFlightGuard {
        self.in_flight.store(true, Ordering::SeqCst);
        InFlightGuard {
            flag: self.in_flight.clone(),
        }
    }

    /// Whether a recognition is currently running
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for AutoRecognizeTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Clears the in-flight flag on drop
pub struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_timer(idle_ms: u64) -> (AutoRecognizeTimer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = AutoRecognizeTimer::new(
            Duration::from_millis(idle_ms),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (timer, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_idle() {
        let (timer, fired) = counting_timer(2000);
        timer.arm();
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_resets_timer() {
        let (timer, fired) = counting_timer(2000);
        timer.arm();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        timer.arm();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (timer, fired) = counting_timer(2000);
        timer.arm();
        assert!(timer.is_armed());
        timer.cancel();
        assert!(!timer.is_armed());
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_while_in_flight() {
        let (timer, fired) = counting_timer(2000);
        let guard = timer.begin_recognition();
        timer.arm();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        drop(guard);
        assert!(!timer.is_in_flight());
        timer.arm();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_arm_without_runtime_is_noop() {
        let (timer, fired) = counting_timer(10);
        timer.arm();
        assert!(!timer.is_armed());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
