//! Reconnect Scheduler (C7) — per-server backoff timer that re-drives the
//! Tunnel Worker on unplanned loss (spec.md §4.7).
//!
//! Grounded on the teacher's `session::reconnect::SessionReconnector`: an
//! atomic attempt counter plus a cancellable sleep loop, driven from a
//! dedicated task rather than retried inline by the caller. Two things
//! change from the teacher's version per spec.md: the backoff formula is
//! `min(2^attempt, 30)` seconds with no attempt cap (the teacher's
//! `max_attempts: 5` and multiplicative-backoff-with-jitter are dropped),
//! and cancellation is driven by the Worker's own disconnect reason rather
//! than a standalone `cancelled: AtomicBool` set from multiple call sites.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

/// Backoff delay for the Nth attempt (N starting at 0), capped at 30s
/// (spec.md §4.7).
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt).min(30);
    Duration::from_secs(secs)
}

/// Per-server single-flight reconnect state. One instance lives for as long
/// as a server's supervising task does; dropped (along with its task) when
/// the server is deleted.
pub struct ReconnectTimer {
    attempt: AtomicU32,
    cancelled: AtomicBool,
}

impl ReconnectTimer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            attempt: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Acquire)
    }

    /// Reset to attempt 0 on a successful reconnection.
    pub fn reset(&self) {
        self.attempt.store(0, Ordering::Release);
    }

    /// Cancel any in-progress wait (user disconnect or server delete).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn clear_cancelled(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    /// Wait out this attempt's backoff delay in short increments so
    /// cancellation is observed promptly. Returns the attempt number just
    /// waited for on success, `None` if cancelled before the delay elapsed.
    pub async fn wait_next(&self, server_id: &str) -> Option<u32> {
        let attempt = self.attempt.fetch_add(1, Ordering::AcqRel);
        let delay = backoff_delay(attempt);
        debug!(server_id, attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        let mut remaining = delay;
        let step = Duration::from_millis(100);
        while remaining > Duration::ZERO {
            if self.is_cancelled() {
                info!(server_id, "reconnect wait cancelled");
                return None;
            }
            let chunk = step.min(remaining);
            tokio::time::sleep(chunk).await;
            remaining = remaining.saturating_sub(chunk);
        }

        if self.is_cancelled() {
            None
        } else {
            Some(attempt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_saturates_at_30s() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
        assert_eq!(backoff_delay(63), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn cancel_interrupts_wait() {
        let timer = ReconnectTimer::new();
        let t = timer.clone();
        let handle = tokio::spawn(async move { t.wait_next("s1").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        timer.cancel();
        let completed = handle.await.unwrap();
        assert_eq!(completed, None);
    }

    #[test]
    fn reset_zeroes_attempt_counter() {
        let timer = ReconnectTimer::new();
        timer.attempt.store(7, Ordering::Release);
        timer.reset();
        assert_eq!(timer.attempt(), 0);
    }
}
