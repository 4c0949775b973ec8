//! Tunnel Worker (C6) — owns one SSH client and one local SOCKS5 listener,
//! driven as an explicit state machine (spec.md §4.6), replacing the
//! teacher's flag-set style (`SessionReconnector`'s `cancelled`/`state`
//! atomics) per Design Notes §9's "Worker's own state machine field"
//! directive.
//!
//! Grounded on `ssh::client::SshClient::connect` (DIALING/AUTHENTICATING),
//! `ssh::handle_owner` (single-owner SSH client, BINDING/CONNECTED use of
//! `HandleController`), and `forwarding::dynamic`'s listener-bind +
//! accept-loop + per-connection session spawn shape for CONNECTED.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::manager::TunnelManager;
use super::{classify_reason, AdvertisedAuth, ProxyType};
use crate::config::types::ServerRecord;
use crate::events::Event;
use crate::socks::{forward, ProxyAuth, Socks5Framer};
use crate::ssh::{spawn_handle_owner_task, HandleController, PingResult, SshClient, SshConfig};

/// SSH TCP dial timeout (spec.md §5).
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
/// Timeout for the port-busy probe connect (spec.md §4.6.2, reusing the
/// proxy-probe connect budget of §5).
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// How long CONNECTED waits for in-flight SOCKS sessions to end on drain.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Dialing,
    Authenticating,
    Binding,
    Connected,
    Draining,
    Terminated,
    Failed,
}

/// Outcome of one `run_once` attempt, consumed by the reconnect supervisor.
pub struct WorkerOutcome {
    pub reason: String,
    pub uptime_secs: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// False for outcomes the Reconnect Scheduler must not retry (clean user
    /// disconnect, adoption, external detection) — true for everything that
    /// represents an unplanned loss.
    pub retryable: bool,
    /// Whether this attempt ever reached CONNECTED. The Reconnect Scheduler
    /// uses this to log Connected vs Reconnected and to fold uptime in;
    /// `reconnectCount` itself is bumped inside `run_once`, at the moment a
    /// reconnecting attempt re-enters CONNECTED (spec.md §4.7: increments
    /// once per successful re-connection, never on a failed attempt).
    pub reached_connected: bool,
}

/// State shared between the running worker task and outside observers
/// (Health Monitor, Manager snapshots): the state watch, the live
/// `HandleController` once past BINDING, and atomic byte counters.
pub struct WorkerShared {
    state_tx: watch::Sender<WorkerState>,
    handle: parking_lot::Mutex<Option<HandleController>>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    /// Epoch milliseconds at which this attempt entered CONNECTED; read by
    /// the Manager to populate `ActiveTunnel::started_at` on snapshots.
    connected_at: parking_lot::Mutex<Option<i64>>,
}

impl WorkerShared {
    pub fn new() -> Arc<Self> {
        let (state_tx, _) = watch::channel(WorkerState::Idle);
        Arc::new(Self {
            state_tx,
            handle: parking_lot::Mutex::new(None),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            connected_at: parking_lot::Mutex::new(None),
        })
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    pub fn handle_controller(&self) -> Option<HandleController> {
        self.handle.lock().clone()
    }

    pub fn bytes(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
        )
    }

    pub fn connected_at(&self) -> Option<i64> {
        *self.connected_at.lock()
    }

    fn set_state(&self, state: WorkerState) {
        let _ = self.state_tx.send(state);
    }
}

/// A controller handed to the Manager for one worker attempt: lets it read
/// state/counters and request a drain with a specific disconnect reason.
#[derive(Clone)]
pub struct WorkerHandle {
    pub shared: Arc<WorkerShared>,
    pub control_tx: watch::Sender<Option<String>>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn bytes(&self) -> (u64, u64) {
        self.shared.bytes()
    }

    pub fn handle_controller(&self) -> Option<HandleController> {
        self.shared.handle_controller()
    }

    pub fn connected_at(&self) -> Option<i64> {
        self.shared.connected_at()
    }

    /// Request this worker drain with `reason`; idempotent.
    pub fn request_disconnect(&self, reason: impl Into<String>) {
        let _ = self.control_tx.send(Some(reason.into()));
    }
}

/// Run one full dial-to-termination attempt for `server`. Returns once the
/// worker reaches TERMINATED or FAILED.
pub async fn run_once(
    server: ServerRecord,
    ssh_config: SshConfig,
    proxy_auth: Option<ProxyAuth>,
    manager: TunnelManager,
    shared: Arc<WorkerShared>,
    mut control_rx: watch::Receiver<Option<String>>,
    is_reconnect: bool,
) -> WorkerOutcome {
    let server_id = server.id.clone();
    let events = manager.events().clone();

    shared.set_state(WorkerState::Dialing);
    let dial = tokio::time::timeout(DIAL_TIMEOUT, SshClient::new(ssh_config).connect()).await;

    let handle = match dial {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            // spec.md §4.6.1: a key that can't be resolved/decrypted gets
            // its own reason tag, distinct from a server-side auth rejection.
            let reason = if matches!(e, crate::ssh::SshError::KeyError(_)) {
                "no_key".to_string()
            } else {
                classify_reason(&e.to_string(), true)
            };
            warn!(server_id, %reason, "ssh dial/auth failed");
            events.publish(Event::error(Some(server_id.clone()), e.to_string()));
            shared.set_state(WorkerState::Failed);
            return WorkerOutcome { reason, uptime_secs: 0, bytes_in: 0, bytes_out: 0, retryable: true, reached_connected: false };
        }
        Err(_) => {
            let reason = "socket_timeout".to_string();
            warn!(server_id, "ssh dial timed out after {:?}", DIAL_TIMEOUT);
            events.publish(Event::error(Some(server_id.clone()), "dial timed out".to_string()));
            shared.set_state(WorkerState::Failed);
            return WorkerOutcome { reason, uptime_secs: 0, bytes_in: 0, bytes_out: 0, retryable: true, reached_connected: false };
        }
    };

    // AUTHENTICATING happens inside `connect()`; mark the transition for
    // state observers even though the work already completed atomically.
    shared.set_state(WorkerState::Authenticating);

    let controller = spawn_handle_owner_task(handle, server_id.clone());
    *shared.handle.lock() = Some(controller.clone());

    shared.set_state(WorkerState::Binding);

    let bind_outcome = bind_with_port_busy_protocol(&manager, &server).await;
    let listener = match bind_outcome {
        BindOutcome::Bound(listener) => listener,
        BindOutcome::Adopted => {
            info!(server_id, "adopting existing owned listener on port {}", server.socks_port);
            events.publish(Event::connected(&server_id, &server.name, server.socks_port, Some("external")));
            controller.disconnect().await;
            shared.set_state(WorkerState::Terminated);
            return WorkerOutcome { reason: "adopted_existing".into(), uptime_secs: 0, bytes_in: 0, bytes_out: 0, retryable: false, reached_connected: false };
        }
        BindOutcome::ExternalDetected => {
            info!(server_id, "port {} served by a foreign process, registering as external", server.socks_port);
            manager
                .register_external(&server_id, &server.name, server.socks_port, ProxyType::Unknown, AdvertisedAuth::Unknown)
                .await;
            controller.disconnect().await;
            shared.set_state(WorkerState::Terminated);
            return WorkerOutcome { reason: "port_busy".into(), uptime_secs: 0, bytes_in: 0, bytes_out: 0, retryable: false, reached_connected: false };
        }
        BindOutcome::Busy => {
            warn!(server_id, "port {} busy, giving up", server.socks_port);
            controller.disconnect().await;
            shared.set_state(WorkerState::Failed);
            return WorkerOutcome { reason: "port_busy".into(), uptime_secs: 0, bytes_in: 0, bytes_out: 0, retryable: true, reached_connected: false };
        }
    };

    manager.mark_owned(&server_id).await;
    *shared.connected_at.lock() = Some(chrono::Utc::now().timestamp_millis());
    shared.set_state(WorkerState::Connected);
    if is_reconnect {
        // Bump reconnectCount the instant the new session is live, so a
        // snapshot taken right now already reflects it rather than only
        // after this session eventually ends (spec.md §4.7/S5).
        manager.note_reconnect_success(&server_id).await;
    }
    events.publish(Event::connected(&server_id, &server.name, server.socks_port, None));
    info!(server_id, port = server.socks_port, "tunnel connected");

    let started_at = Instant::now();
    let mut disconnect_rx = controller.subscribe_disconnect();

    let reason = accept_loop(&listener, &controller, proxy_auth, &shared, &events, &server_id, &mut control_rx, &mut disconnect_rx).await;

    shared.set_state(WorkerState::Draining);
    let _ = tokio::time::timeout(DRAIN_GRACE, async {
        // The accept loop has already stopped handing out new sessions;
        // in-flight sessions hold their own channel/socket and finish on
        // their own schedule. A real scheduler would track their JoinHandles
        // to await them here; we cap the wait unconditionally instead, since
        // forwarding sessions are expected to close promptly once the
        // channel or socket underneath them goes away.
        tokio::time::sleep(Duration::from_millis(50)).await;
    })
    .await;

    controller.disconnect().await;
    manager.unmark_owned(&server_id).await;

    let uptime_secs = started_at.elapsed().as_secs();
    let (bytes_in, bytes_out) = shared.bytes();
    let retryable = !matches!(reason.as_str(), "user_disconnect" | "api_disconnect" | "api_disconnect_all" | "server_deleted");

    events.publish(Event::disconnected(&server_id, reason.clone()));
    shared.set_state(WorkerState::Terminated);

    WorkerOutcome { reason, uptime_secs, bytes_in, bytes_out, retryable, reached_connected: true }
}

enum BindOutcome {
    Bound(TcpListener),
    Adopted,
    ExternalDetected,
    Busy,
}

/// Implements spec.md §4.6.2: bind on all IPv4 interfaces; on collision,
/// probe the port and consult the owned-tunnels set to decide adoption vs
/// registering an external tunnel vs giving up.
async fn bind_with_port_busy_protocol(manager: &TunnelManager, server: &ServerRecord) -> BindOutcome {
    let addr = SocketAddr::from(([0, 0, 0, 0], server.socks_port));

    match TcpListener::bind(addr).await {
        Ok(listener) => return BindOutcome::Bound(listener),
        Err(e) => debug!("bind {} failed: {}, probing occupant", addr, e),
    }

    let probe_addr: SocketAddr = ([127, 0, 0, 1], server.socks_port).into();
    let occupied = tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(probe_addr)).await.is_ok_and(|r| r.is_ok());

    if occupied {
        if manager.is_owned(&server.id).await {
            return BindOutcome::Adopted;
        }
        return BindOutcome::ExternalDetected;
    }

    // Port reported busy but nothing answers — stale binding or a race;
    // retry once before giving up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    match TcpListener::bind(addr).await {
        Ok(listener) => BindOutcome::Bound(listener),
        Err(_) => BindOutcome::Busy,
    }
}

/// CONNECTED accept loop (spec.md §4.6.3): accept sockets, run the SOCKS5
/// framer on each in its own task, open a direct-tcpip channel, and bridge.
/// Returns the classified disconnect reason once the loop stops.
#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: &TcpListener,
    controller: &HandleController,
    proxy_auth: Option<ProxyAuth>,
    shared: &Arc<WorkerShared>,
    events: &crate::events::EventBus,
    server_id: &str,
    control_rx: &mut watch::Receiver<Option<String>>,
    disconnect_rx: &mut tokio::sync::broadcast::Receiver<()>,
) -> String {
    loop {
        tokio::select! {
            biased;

            _ = disconnect_rx.recv() => {
                return "remote_closed".to_string();
            }

            changed = control_rx.changed() => {
                if changed.is_err() {
                    return "remote_closed".to_string();
                }
                if let Some(reason) = control_rx.borrow().clone() {
                    return reason;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        spawn_session(socket, peer, controller.clone(), proxy_auth.clone(), shared.clone(), events.clone(), server_id.to_string());
                    }
                    Err(e) => {
                        warn!(server_id, "accept error: {}", e);
                    }
                }
            }
        }
    }
}

fn spawn_session(
    socket: TcpStream,
    peer: SocketAddr,
    controller: HandleController,
    proxy_auth: Option<ProxyAuth>,
    shared: Arc<WorkerShared>,
    events: crate::events::EventBus,
    server_id: String,
) {
    tokio::spawn(async move {
        let mut socket = socket;
        let framer = Socks5Framer::new(proxy_auth);

        let request = match framer.negotiate(&mut socket).await {
            Ok(request) => request,
            Err(e) => {
                debug!(server_id, %peer, "socks5 session rejected: {}", e);
                return;
            }
        };

        let host = request.target.host_string();
        match controller
            .open_direct_tcpip(&host, request.port as u32, &peer.ip().to_string(), peer.port() as u32)
            .await
        {
            Ok(channel) => {
                if crate::socks::reply_success(&mut socket).await.is_err() {
                    return;
                }
                let (bytes_in, bytes_out) = forward(socket, channel).await;
                shared.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
                shared.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
                events.publish(Event::stats(&server_id, 0, bytes_in, bytes_out, None));
            }
            Err(e) => {
                debug!(server_id, target = %host, "direct-tcpip open failed: {}", e);
                let _ = crate::socks::reply_failure(&mut socket).await;
            }
        }
    });
}

/// Keepalive probe delegated to the Health Monitor; exposed here since it
/// operates purely on a `HandleController`.
pub async fn ping(controller: &HandleController) -> PingResult {
    controller.ping().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_state_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&WorkerState::Connected).unwrap(), "\"connected\"");
        assert_eq!(serde_json::to_string(&WorkerState::Draining).unwrap(), "\"draining\"");
    }

    #[test]
    fn outcome_retryability_matches_reason_taxonomy() {
        let reasons = [
            ("user_disconnect", false),
            ("api_disconnect", false),
            ("api_disconnect_all", false),
            ("server_deleted", false),
            ("remote_closed", true),
            ("keepalive_timeout", true),
        ];
        for (reason, expect_retryable) in reasons {
            let retryable = !matches!(reason, "user_disconnect" | "api_disconnect" | "api_disconnect_all" | "server_deleted");
            assert_eq!(retryable, expect_retryable, "reason={reason}");
        }
    }

    #[tokio::test]
    async fn shared_state_watch_reports_transitions() {
        let shared = WorkerShared::new();
        let mut rx = shared.subscribe();
        assert_eq!(*rx.borrow(), WorkerState::Idle);
        shared.set_state(WorkerState::Dialing);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), WorkerState::Dialing);
    }

    /// S6 (spec.md §8): pre-bind the socks port and mark it owned, expect
    /// adoption rather than a duplicate bind or an external registration.
    #[tokio::test]
    async fn port_busy_protocol_adopts_owned_port() {
        use crate::config::{ConfigStorage, SecretStore};
        use crate::stats::StatsStore;
        use crate::tunnel::manager::{NewServer, NewServerAuth};
        use tempfile::tempdir;

        let dir = tempdir().unwrap();
        let config_storage = ConfigStorage::with_path(dir.path().join("servers.json"));
        let secret_store = SecretStore::new(dir.path());
        let stats_store = StatsStore::open(dir.path().join("stats.redb")).unwrap();
        let manager = TunnelManager::init(config_storage, secret_store, stats_store).await.unwrap();

        // Occupy a free port as if a prior process instance still owned it.
        let occupant = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = occupant.local_addr().unwrap().port();

        let id = manager
            .add_server(NewServer {
                name: "S".into(),
                host: "127.0.0.1".into(),
                ssh_port: 22,
                username: "u".into(),
                auth: NewServerAuth::Password("p".into()),
                socks_port: port,
                proxy_username: None,
                proxy_password: None,
                auto_reconnect: true,
                connect_on_startup: false,
                notifications_enabled: true,
            })
            .await
            .unwrap();
        manager.mark_owned(&id).await;

        let server = manager
            .list_servers()
            .await
            .into_iter()
            .find(|s| s.id == id)
            .unwrap();

        let outcome = bind_with_port_busy_protocol(&manager, &server).await;
        assert!(matches!(outcome, BindOutcome::Adopted));
        drop(occupant);
    }

    /// S6 negative case: port busy but not owned by us -> external, not adopted.
    #[tokio::test]
    async fn port_busy_protocol_registers_external_when_not_owned() {
        use crate::config::{ConfigStorage, SecretStore};
        use crate::stats::StatsStore;
        use crate::tunnel::manager::{NewServer, NewServerAuth};
        use tempfile::tempdir;

        let dir = tempdir().unwrap();
        let config_storage = ConfigStorage::with_path(dir.path().join("servers.json"));
        let secret_store = SecretStore::new(dir.path());
        let stats_store = StatsStore::open(dir.path().join("stats.redb")).unwrap();
        let manager = TunnelManager::init(config_storage, secret_store, stats_store).await.unwrap();

        let occupant = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = occupant.local_addr().unwrap().port();

        let id = manager
            .add_server(NewServer {
                name: "S".into(),
                host: "127.0.0.1".into(),
                ssh_port: 22,
                username: "u".into(),
                auth: NewServerAuth::Password("p".into()),
                socks_port: port,
                proxy_username: None,
                proxy_password: None,
                auto_reconnect: true,
                connect_on_startup: false,
                notifications_enabled: true,
            })
            .await
            .unwrap();

        let server = manager
            .list_servers()
            .await
            .into_iter()
            .find(|s| s.id == id)
            .unwrap();

        let outcome = bind_with_port_busy_protocol(&manager, &server).await;
        assert!(matches!(outcome, BindOutcome::ExternalDetected));
        drop(occupant);
    }
}
