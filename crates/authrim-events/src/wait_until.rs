//! Background work that must complete past the response.
//!
//! Logout fan-out, event publication and mirror writes are scheduled here:
//! the request handler returns immediately, and shutdown drains the tracker
//! before the process exits.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

#[derive(Clone)]
pub struct WaitUntil {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl WaitUntil {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Schedule work that outlives the current request. The future runs to
    /// completion even if the request is cancelled; only process shutdown
    /// (after the drain timeout) cancels it.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = fut => {}
                _ = cancel.cancelled() => {
                    warn!("background task cancelled during shutdown drain");
                }
            }
        });
    }

    /// Drain outstanding work. Tasks still running after `timeout` are
    /// cancelled cooperatively.
    pub async fn shutdown(&self, timeout: Duration) {
        self.tracker.close();
        info!(pending = self.tracker.len(), "draining background tasks");
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!("drain timeout reached, cancelling remaining background tasks");
            self.cancel.cancel();
            self.tracker.wait().await;
        }
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }
}

impl Default for WaitUntil {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_waits_for_scheduled_work() {
        let pool = WaitUntil::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        pool.spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });

        pool.shutdown(Duration::from_secs(1)).await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drain_timeout_cancels_stuck_work() {
        let pool = WaitUntil::new();
        pool.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        // Must return promptly despite the stuck task.
        pool.shutdown(Duration::from_millis(50)).await;
    }
}
