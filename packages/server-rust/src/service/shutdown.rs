//! Stop signalling and in-flight call tracking for the serve loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Coordinates the end of a serve loop.
///
/// 1. Consumers select on `stopped()` and exit once `trigger()` is called
/// 2. The serve loop calls `mark_consumers_stopped()` after joining them
/// 3. Each dispatched call holds an `InFlightGuard`
/// 4. `wait_for_drain()` returns once no guard is alive, or on timeout
#[derive(Debug)]
pub struct ShutdownController {
    stop_signal: watch::Sender<bool>,
    consumers_done: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (stop_signal, _) = watch::channel(false);
        let (consumers_done, _) = watch::channel(false);
        Self {
            stop_signal,
            consumers_done,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Resolves once `trigger()` has been called, including before this call.
    pub async fn stopped(&self) {
        let mut rx = self.stop_signal.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Signals every `stopped()` waiter. Idempotent.
    pub fn trigger(&self) {
        self.stop_signal.send_replace(true);
    }

    /// Records that no consumer can start another call.
    pub fn mark_consumers_stopped(&self) {
        self.consumers_done.send_replace(true);
    }

    /// Resolves once `mark_consumers_stopped()` has been called.
    pub async fn consumers_stopped(&self) {
        let mut rx = self.consumers_done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Counts one call as in flight until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits for all in-flight calls to finish, up to `timeout`.
    ///
    /// Returns `false` if calls were still running at the deadline.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_track_in_flight_calls() {
        let controller = ShutdownController::new();
        let first = controller.in_flight_guard();
        let second = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);

        drop(first);
        assert_eq!(controller.in_flight_count(), 1);
        drop(second);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn trigger_wakes_pending_waiters() {
        let controller = Arc::new(ShutdownController::new());
        let waiter = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.stopped().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        controller.trigger();
        controller.trigger();
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn consumers_stopped_waits_for_the_mark() {
        let controller = Arc::new(ShutdownController::new());
        controller.trigger();

        let pending =
            tokio::time::timeout(Duration::from_millis(50), controller.consumers_stopped()).await;
        assert!(pending.is_err());

        let marker = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                controller.mark_consumers_stopped();
            }
        });
        controller.consumers_stopped().await;
        marker.await.unwrap();
    }

    #[tokio::test]
    async fn stopped_resolves_after_earlier_trigger() {
        let controller = ShutdownController::new();
        controller.trigger();
        controller.stopped().await;
    }

    #[tokio::test]
    async fn drain_with_nothing_in_flight_is_immediate() {
        let controller = ShutdownController::new();
        assert!(controller.wait_for_drain(Duration::from_millis(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_guard_release() {
        let controller = Arc::new(ShutdownController::new());
        let guard = controller.in_flight_guard();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(1)).await);
        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_while_guard_is_held() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard();
        assert!(!controller.wait_for_drain(Duration::from_millis(100)).await);
    }
}
