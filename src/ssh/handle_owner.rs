//! Handle Owner Task
//!
//! Implements the "single owner" pattern for the SSH `Handle`: exactly one
//! task owns `Handle<ClientHandler>`, and every other task that needs it
//! (the Worker's accept loop, the Health Monitor) talks to it through a
//! `HandleController` over an mpsc command channel. This is what spec.md
//! §5 means by "each Worker owns its SSH client... exclusively" — it avoids
//! `Arc<Mutex<Handle>>` contention and the deadlocks that come from holding
//! a lock across `.await`.

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Distinguishes keepalive outcomes so the Health Monitor and Reconnect
/// Scheduler can react differently to a soft timeout versus a hard drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply within the deadline; may be transient network latency.
    Timeout,
    /// The underlying connection reported an error or disconnect.
    IoError,
}

/// Commands sent to the Handle Owner Task.
pub enum HandleCommand {
    /// Open a direct-tcpip channel (the Tunnel Worker's BINDING/CONNECTED
    /// accept loop forwards one SOCKS5 CONNECT per channel).
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Keepalive probe for the Health Monitor.
    Ping { reply_tx: oneshot::Sender<PingResult> },

    /// Disconnect the SSH connection (DRAINING → TERMINATED).
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task.
///
/// `Clone`, cheap (just copies the `Sender`s). Any holder has full control
/// over the connection — open channels, ping, or disconnect it — so this is
/// an in-process trust boundary, never exposed across the Control API.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Subscribers (SOCKS sessions on this tunnel) learn about disconnects
    /// here instead of polling `is_connected`.
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Mainly useful in tests; production code uses `spawn_handle_owner_task`.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self { cmd_tx, disconnect_tx }
    }

    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a direct-tcpip channel for one forwarded SOCKS5 connection.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Keepalive probe; never blocks longer than the owner task's internal
    /// 5s timeout.
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task, consuming the `Handle` and returning a
/// `HandleController` for sending it commands.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;

        info!("Handle owner task started for session {}", session_id);

        loop {
            match cmd_rx.recv().await {
                Some(HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                }) => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("caller dropped before receiving direct_tcpip result");
                    }
                }

                Some(HandleCommand::Ping { reply_tx }) => {
                    // send_keepalive(true) issues SSH_MSG_GLOBAL_REQUEST
                    // "keepalive@openssh.com" with want_reply=true — the
                    // proper SSH heartbeat, unlike channel_open_session
                    // hacks that leak channels on some servers.
                    debug!("keepalive probe for session {}", session_id);
                    let result = match tokio::time::timeout(
                        std::time::Duration::from_secs(5),
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => {
                            debug!("keepalive ok for session {}", session_id);
                            PingResult::Ok
                        }
                        Ok(Err(e)) => {
                            let error_str = format!("{:?}", e);
                            if error_str.to_lowercase().contains("disconnect") {
                                warn!("keepalive disconnect for session {}: {:?}", session_id, e);
                                PingResult::IoError
                            } else {
                                warn!(
                                    "keepalive error for session {} (treating as soft failure): {:?}",
                                    session_id, e
                                );
                                PingResult::Timeout
                            }
                        }
                        Err(_) => {
                            warn!("keepalive timeout for session {} (5s)", session_id);
                            PingResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }

                Some(HandleCommand::Disconnect) => {
                    info!("disconnect requested for session {}", session_id);
                    break;
                }

                None => {
                    info!("all controllers dropped for session {}", session_id);
                    break;
                }
            }
        }

        let _ = disconnect_tx_clone.send(());
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("handle owner task terminated for session {}", session_id);
    });

    HandleController { cmd_tx, disconnect_tx }
}

/// Drain commands left in the queue after the owner loop exits, so senders
/// waiting on a reply get `Disconnected` instead of hanging forever.
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn controller_reports_disconnected_after_owner_drops() {
        let (cmd_tx, cmd_rx) = mpsc::channel::<HandleCommand>(4);
        drop(cmd_rx);
        let controller = HandleController::new(cmd_tx);
        assert!(!controller.is_connected());
        assert_eq!(controller.ping().await, PingResult::IoError);
    }
}
