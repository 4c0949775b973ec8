//! Health Monitor (C8) — periodic liveness and latency measurement for
//! every non-external `ActiveTunnel` (spec.md §4.8).
//!
//! Grounded on the teacher's `session::health::HealthTracker`'s
//! periodic-measurement shape, stripped of the parts spec.md doesn't call
//! for (packet-loss accounting, `HealthStatus` thresholds, resource
//! metrics): this monitor does one thing every tick — ask
//! `ssh::HandleController::ping` whether the session is alive and, if so,
//! how long the round trip took — and lets the Worker and Stats Store do
//! the rest.

use std::time::Duration;

use tracing::{debug, warn};

use super::manager::TunnelManager;
use super::worker::WorkerState;
use crate::ssh::PingResult;

/// Tick interval (spec.md §4.8).
const TICK_INTERVAL: Duration = Duration::from_secs(30);
/// Outer timeout for one latency measurement (spec.md §5).
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Runs forever, ticking every [`TICK_INTERVAL`] over the Manager's
/// connected internal tunnels.
pub async fn run(manager: TunnelManager) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.tick().await; // first tick is immediate; skip it

    loop {
        ticker.tick().await;
        let workers = manager.internal_workers().await;
        for (server_id, handle) in workers {
            if handle.state() != WorkerState::Connected {
                continue;
            }
            let Some(controller) = handle.handle_controller() else {
                continue;
            };

            if !controller.is_connected() {
                debug!(server_id, "health monitor: handle owner task gone, synthesizing keepalive_timeout");
                handle.request_disconnect("keepalive_timeout");
                continue;
            }

            let started = tokio::time::Instant::now();
            let result = tokio::time::timeout(PROBE_TIMEOUT, controller.ping()).await;

            let latency_ms = match result {
                Ok(PingResult::Ok) => Some(started.elapsed().as_millis() as u64),
                Ok(PingResult::Timeout) | Ok(PingResult::IoError) => {
                    warn!(server_id, "health monitor: keepalive probe failed, non-fatal");
                    None
                }
                Err(_) => {
                    warn!(server_id, "health monitor: probe exceeded {:?}", PROBE_TIMEOUT);
                    None
                }
            };

            manager.record_health_sample(&server_id, latency_ms).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_and_probe_deadlines_match_spec() {
        assert_eq!(TICK_INTERVAL, Duration::from_secs(30));
        assert_eq!(PROBE_TIMEOUT, Duration::from_secs(15));
    }
}
