// ABOUTME: Fixed-window rate governor shared by a client's ticker and executor loops.
// ABOUTME: Counter grows on each issue and is zeroed once per window by the background tick.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Counts requests issued in the current window against a per-window cap
#[derive(Debug)]
pub struct RateGovernor {
    issued: AtomicU32,
    cap: u32,
    window: Duration,
    reset: Notify,
}

impl RateGovernor {
    pub fn new(window: Duration, cap: u32) -> Self {
        Self {
            issued: AtomicU32::new(0),
            cap: cap.max(1),
            window,
            reset: Notify::new(),
        }
    }

    /// True while the current window is under its cap
    pub fn permit(&self) -> bool {
        self.issued.load(Ordering::Acquire) < self.cap
    }

    /// Count one issued unit against the current window
    pub fn record_issue(&self) {
        self.record_issues(1);
    }

    pub fn record_issues(&self, n: u32) {
        self.issued.fetch_add(n, Ordering::AcqRel);
    }

    /// Units left in the current window
    pub fn remaining(&self) -> u32 {
        self.cap.saturating_sub(self.issued.load(Ordering::Acquire))
    }

    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::Acquire)
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Resolve once issuing is permitted, waiting for window resets as needed
    pub async fn ready(&self) {
        loop {
            let notified = self.reset.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.permit() {
                return;
            }
            notified.await;
        }
    }

    /// Zero the counter and wake anything blocked in `ready`
    fn reset(&self) {
        self.issued.store(0, Ordering::Release);
        self.reset.notify_waiters();
    }

    /// Background loop: sleep one window, zero the counter, forever.
    ///
    /// Runs until the owning client aborts the task.
    pub async fn tick(&self) {
        loop {
            tokio::time::sleep(self.window).await;
            let issued = self.issued();
            self.reset();
            if issued > 0 {
                tracing::trace!(issued, cap = self.cap, "Rate window reset");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_permit_until_cap() {
        let governor = RateGovernor::new(Duration::from_secs(1), 3);
        assert!(governor.permit());
        governor.record_issue();
        governor.record_issue();
        assert!(governor.permit());
        assert_eq!(governor.remaining(), 1);
        governor.record_issue();
        assert!(!governor.permit());
        assert_eq!(governor.remaining(), 0);
    }

    #[test]
    fn test_zero_cap_is_clamped() {
        let governor = RateGovernor::new(Duration::from_secs(1), 0);
        assert_eq!(governor.cap(), 1);
        assert!(governor.permit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_restores_permit_after_window() {
        let governor = Arc::new(RateGovernor::new(Duration::from_secs(1), 2));
        let ticker = {
            let governor = Arc::clone(&governor);
            tokio::spawn(async move { governor.tick().await })
        };

        governor.record_issue();
        governor.record_issue();
        assert!(!governor.permit());

        // Half a window: still blocked, nothing decremented mid-window
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!governor.permit());
        assert_eq!(governor.issued(), 2);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(governor.permit());
        assert_eq!(governor.issued(), 0);

        ticker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_waits_for_reset() {
        let governor = Arc::new(RateGovernor::new(Duration::from_secs(1), 1));
        let ticker = {
            let governor = Arc::clone(&governor);
            tokio::spawn(async move { governor.tick().await })
        };

        governor.record_issue();
        let start = tokio::time::Instant::now();
        governor.ready().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(governor.permit());

        ticker.abort();
    }
}
