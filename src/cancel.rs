//! Shared cooperative cancellation flag.
//!
//! Long-running tasks (playback, recording, CV-AUTO) poll the flag; sleeps
//! are subdivided into ≤10 ms slices so a stop request is observed within
//! one slice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Granularity of cancellable sleeps.
pub const POLL_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm a flag for a fresh run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Sleep for `secs`, checking the flag every [`POLL_SLICE`].
    /// Returns `true` if the sleep was interrupted by cancellation.
    pub async fn sleep_cancellable(&self, secs: f64) -> bool {
        if secs <= 0.0 {
            return self.is_cancelled();
        }
        let mut remaining = Duration::from_secs_f64(secs);
        while remaining > Duration::ZERO {
            if self.is_cancelled() {
                return true;
            }
            let slice = remaining.min(POLL_SLICE);
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
        self.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_when_not_cancelled() {
        let flag = CancelFlag::new();
        let start = tokio::time::Instant::now();
        assert!(!flag.sleep_cancellable(0.25).await);
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_observed_within_a_slice() {
        let flag = CancelFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move { waiter.sleep_cancellable(60.0).await });
        tokio::time::sleep(Duration::from_millis(35)).await;
        flag.cancel();
        assert!(handle.await.unwrap());
    }
}
