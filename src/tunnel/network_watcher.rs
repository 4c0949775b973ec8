//! Network Watcher (C9) — reconnects eligible servers after the host comes
//! back online (spec.md §4.9).
//!
//! New code; the closest grounding in the teacher is `AutoReconnectService`
//! in `session::auto_reconnect` — the coordinating layer that reacts to a
//! connectivity signal and re-invokes connect — reimplemented here against
//! the Tunnel Manager instead of a Tauri session registry. The actual
//! OS-level online/offline notifier is out of scope (spec.md §1); this
//! module only consumes the abstracted transition channel.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::manager::TunnelManager;
use super::worker::WorkerState;

/// Settle delay after `online` before reconnecting (spec.md §4.9).
const SETTLE_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTransition {
    Online,
    Offline,
}

/// Runs forever, consuming connectivity transitions from `rx` and
/// reconnecting eligible servers after an `Online` transition settles.
pub async fn run(manager: TunnelManager, mut rx: mpsc::Receiver<NetworkTransition>) {
    while let Some(transition) = rx.recv().await {
        match transition {
            NetworkTransition::Offline => {
                debug!("network watcher: offline, no action");
            }
            NetworkTransition::Online => {
                info!("network watcher: online, settling for {:?}", SETTLE_DELAY);
                tokio::time::sleep(SETTLE_DELAY).await;
                reconnect_eligible(&manager).await;
            }
        }
    }
}

async fn reconnect_eligible(manager: &TunnelManager) {
    let live: std::collections::HashSet<String> = manager
        .internal_workers()
        .await
        .into_iter()
        .filter(|(_, handle)| !matches!(handle.state(), WorkerState::Terminated | WorkerState::Failed))
        .map(|(id, _)| id)
        .collect();

    for server in manager.list_servers().await {
        if !(server.is_enabled || server.connect_on_startup) {
            continue;
        }
        if live.contains(&server.id) {
            continue;
        }
        info!(server_id = %server.id, "network watcher: reconnecting after online transition");
        if let Err(e) = manager.connect(&server.id).await {
            debug!(server_id = %server.id, "network watcher: reconnect failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settle_delay_matches_spec() {
        assert_eq!(SETTLE_DELAY, Duration::from_secs(3));
    }
}
