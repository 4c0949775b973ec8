//! Tunnel Manager (C11) — directory of Workers; orchestrates C1–C10.
//!
//! Grounded on the teacher's `forwarding::manager::ForwardingManager`: one
//! `RwLock<HashMap<id, Entry>>` directory per kind of thing it owns, a
//! "stopped but remembered" side-table so a tunnel can be re-armed without
//! re-entering its configuration, and a coarse lock held only across short
//! critical sections (spec.md §5) — connect/dial/auth/bind and all socket
//! I/O happen after the lock is released. The init-sequence barrier
//! (loadApiAuth → loadServers → loadProfiles → open barrier → start Control
//! API) mirrors `lib.rs`'s registry-construction-then-wire-together order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use super::reconnect::{backoff_delay, ReconnectTimer};
use super::scanner;
use super::worker::{self, WorkerHandle, WorkerShared, WorkerState};
use super::{ActiveTunnel, AdvertisedAuth, ProxyType};
use crate::config::types::{AuthType, ConfigFile, QuickProfile, ServerRecord, CONFIG_VERSION};
use crate::config::{ConfigStorage, SecretStore};
use crate::events::{Event, EventBus, LogEntry, LogKind};
use crate::socks::ProxyAuth;
use crate::ssh::{AuthMethod, SshConfig};
use crate::stats::{Period, StatsSample, StatsStore};

/// Bound on the in-memory activity ring (spec.md §3).
const LOG_RING_CAPACITY: usize = 500;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("server not found: {0}")]
    ServerNotFound(String),
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("config storage error: {0}")]
    Storage(#[from] crate::config::StorageError),
    #[error("stats store error: {0}")]
    Stats(#[from] crate::stats::StatsError),
}

impl Serialize for ManagerError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl ManagerError {
    /// HTTP status this error should surface as (spec.md §7).
    pub fn status_code(&self) -> u16 {
        match self {
            ManagerError::ServerNotFound(_) | ManagerError::ProfileNotFound(_) => 404,
            ManagerError::Validation(_) => 400,
            ManagerError::Storage(_) | ManagerError::Stats(_) => 500,
        }
    }
}

/// Requested shape for a new server; secrets are split off and written to
/// the Secret Store separately from the persisted record.
pub struct NewServer {
    pub name: String,
    pub host: String,
    pub ssh_port: u16,
    pub username: String,
    pub auth: NewServerAuth,
    pub socks_port: u16,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    pub auto_reconnect: bool,
    pub connect_on_startup: bool,
    pub notifications_enabled: bool,
}

pub enum NewServerAuth {
    Password(String),
    Key { key_path: String, passphrase: Option<String> },
}

/// Partial update for `PUT /servers/{id}`. `None` leaves the field alone;
/// secret fields are only rewritten when `Some`.
#[derive(Default)]
pub struct ServerPatch {
    pub name: Option<String>,
    pub host: Option<String>,
    pub ssh_port: Option<u16>,
    pub username: Option<String>,
    pub socks_port: Option<u16>,
    pub proxy_username: Option<Option<String>>,
    pub proxy_password: Option<Option<String>>,
    pub auto_reconnect: Option<bool>,
    pub connect_on_startup: Option<bool>,
    pub notifications_enabled: Option<bool>,
    pub is_enabled: Option<bool>,
    pub new_password: Option<String>,
    pub new_key: Option<(String, Option<String>)>,
}

#[derive(Debug, Clone, Default, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub scanned: u32,
    pub total: u32,
    pub running: bool,
}

/// Per-server directory entry: the currently running (or most recently run)
/// Worker plus the accumulators that survive across reconnect attempts.
struct WorkerEntry {
    /// Swapped by the supervisor loop at the start of every attempt so
    /// outside readers (`internal_workers`, snapshots) always see the live
    /// handle without needing to go through the supervisor itself.
    current: parking_lot::RwLock<WorkerHandle>,
    reconnect: Arc<ReconnectTimer>,
    supervisor: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    total_uptime: AtomicU64,
    reconnect_count: AtomicU32,
    latency_ms: parking_lot::Mutex<Option<u64>>,
    last_keepalive_at: parking_lot::Mutex<Option<i64>>,
    display_name: parking_lot::Mutex<String>,
    socks_port: AtomicU16,
}

impl WorkerEntry {
    fn snapshot(&self, server_id: &str, now_ms: i64) -> Option<ActiveTunnel> {
        let handle = self.current.read().clone();
        if handle.state() != WorkerState::Connected {
            return None;
        }
        let (bytes_in, bytes_out) = handle.bytes();
        let started_at = handle.connected_at().unwrap_or(now_ms);
        Some(ActiveTunnel {
            server_id: server_id.to_string(),
            display_name: self.display_name.lock().clone(),
            socks_port: self.socks_port.load(Ordering::Relaxed),
            started_at,
            is_external: false,
            proxy_type: ProxyType::Unknown,
            advertised_auth: AdvertisedAuth::Unknown,
            bytes_in,
            bytes_out,
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            total_uptime: self.total_uptime.load(Ordering::Relaxed),
            latency_ms: *self.latency_ms.lock(),
            last_keepalive_at: *self.last_keepalive_at.lock(),
        })
    }
}

struct Inner {
    config_storage: ConfigStorage,
    secret_store: SecretStore,
    stats_store: StatsStore,
    events: EventBus,
    servers: RwLock<Vec<ServerRecord>>,
    profiles: RwLock<Vec<QuickProfile>>,
    owned: RwLock<HashSet<String>>,
    workers: RwLock<HashMap<String, Arc<WorkerEntry>>>,
    /// ActiveTunnel snapshots not backed by a live Worker in this process:
    /// true port-scanner externals (`isExternal=true`) and servers adopted
    /// from another instance's owned listener (`isExternal=false`, the
    /// `connected{source:"external"}` case of spec.md §4.6.2/S6).
    passive: RwLock<HashMap<String, ActiveTunnel>>,
    logs: parking_lot::Mutex<std::collections::VecDeque<LogEntry>>,
    api_auth_enabled: AtomicBool,
    api_token: parking_lot::Mutex<Option<String>>,
    scan_progress: parking_lot::Mutex<ScanProgress>,
    started_at: std::time::Instant,
}

/// Directory of workers; orchestrates C1–C10. Cheaply `Clone`, like
/// `EventBus` — every clone shares the same state.
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

impl TunnelManager {
    /// Init sequence (spec.md §4.11): loadApiAuth → loadServers →
    /// loadProfiles → open completion barrier. The barrier is the fact that
    /// this function is `async` and the caller (main.rs) does not start the
    /// Control API until it resolves — no mutating call can race the load.
    pub async fn init(
        config_storage: ConfigStorage,
        secret_store: SecretStore,
        stats_store: StatsStore,
    ) -> Result<Self, ManagerError> {
        let config = config_storage.load().await?;

        let manager = Self {
            inner: Arc::new(Inner {
                config_storage,
                secret_store,
                stats_store,
                events: EventBus::new(),
                servers: RwLock::new(config.servers),
                profiles: RwLock::new(config.profiles),
                owned: RwLock::new(config.owned_tunnels.into_iter().collect()),
                workers: RwLock::new(HashMap::new()),
                passive: RwLock::new(HashMap::new()),
                logs: parking_lot::Mutex::new(std::collections::VecDeque::with_capacity(LOG_RING_CAPACITY)),
                api_auth_enabled: AtomicBool::new(config.api_auth_enabled),
                api_token: parking_lot::Mutex::new(config.api_token),
                scan_progress: parking_lot::Mutex::new(ScanProgress::default()),
                started_at: std::time::Instant::now(),
            }),
        };

        Ok(manager)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    // --- API auth -------------------------------------------------------

    pub fn api_auth_enabled(&self) -> bool {
        self.inner.api_auth_enabled.load(Ordering::Relaxed)
    }

    pub fn api_token(&self) -> Option<String> {
        self.inner.api_token.lock().clone()
    }

    /// Generates a token if auth is enabled and none exists yet; called
    /// once during startup (`loadApiAuth`).
    pub async fn ensure_api_token(&self) {
        if !self.api_auth_enabled() {
            return;
        }
        if self.inner.api_token.lock().is_some() {
            return;
        }
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = hex_encode(&bytes);
        *self.inner.api_token.lock() = Some(token);
        self.persist().await;
    }

    // --- owned-tunnels persisted set (spec.md §4.6.2/§6) -----------------

    pub async fn mark_owned(&self, server_id: &str) {
        self.inner.owned.write().await.insert(server_id.to_string());
        self.persist().await;
    }

    pub async fn unmark_owned(&self, server_id: &str) {
        self.inner.owned.write().await.remove(server_id);
        self.persist().await;
    }

    pub async fn is_owned(&self, server_id: &str) -> bool {
        self.inner.owned.read().await.contains(server_id)
    }

    /// Records that `server_id`'s worker just reached CONNECTED on a
    /// reconnection attempt — bumps `reconnectCount` and resets backoff the
    /// instant the new session goes live (spec.md §4.7/S5), rather than
    /// waiting for that session to later terminate.
    pub(crate) async fn note_reconnect_success(&self, server_id: &str) {
        if let Some(entry) = self.inner.workers.read().await.get(server_id) {
            entry.reconnect_count.fetch_add(1, Ordering::Relaxed);
            entry.reconnect.reset();
        }
    }

    // --- persistence ------------------------------------------------------

    async fn persist(&self) {
        let config = ConfigFile {
            version: CONFIG_VERSION,
            servers: self.inner.servers.read().await.clone(),
            profiles: self.inner.profiles.read().await.clone(),
            owned_tunnels: self.inner.owned.read().await.iter().cloned().collect(),
            api_auth_enabled: self.api_auth_enabled(),
            api_token: self.api_token(),
        };
        if let Err(e) = self.inner.config_storage.save(&config).await {
            warn!("tunnel manager: failed to persist config: {}", e);
        }
    }

    fn push_log(&self, server_name: &str, kind: LogKind, details: Option<String>) {
        let mut logs = self.inner.logs.lock();
        if logs.len() == LOG_RING_CAPACITY {
            logs.pop_front();
        }
        logs.push_back(LogEntry::new(server_name, kind, details));
    }

    pub fn logs(&self, limit: usize) -> Vec<LogEntry> {
        let logs = self.inner.logs.lock();
        logs.iter().rev().take(limit).cloned().collect()
    }

    // --- servers ----------------------------------------------------------

    pub async fn list_servers(&self) -> Vec<ServerRecord> {
        self.inner.servers.read().await.clone()
    }

    async fn find_server(&self, id: &str) -> Result<ServerRecord, ManagerError> {
        self.inner
            .servers
            .read()
            .await
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| ManagerError::ServerNotFound(id.to_string()))
    }

    pub async fn add_server(&self, req: NewServer) -> Result<String, ManagerError> {
        if req.socks_port == 0 {
            return Err(ManagerError::Validation("socksPort must be 1..65535".into()));
        }
        if req.ssh_port == 0 {
            return Err(ManagerError::Validation("sshPort must be 1..65535".into()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let auth_type = match &req.auth {
            NewServerAuth::Password(password) => {
                self.inner.secret_store.put(&format!("password_{id}"), password.as_bytes()).await.ok();
                AuthType::Password
            }
            NewServerAuth::Key { key_path: _, passphrase } => {
                if let Some(passphrase) = passphrase {
                    self.inner.secret_store.put(&format!("keyPassphrase_{id}"), passphrase.as_bytes()).await.ok();
                }
                AuthType::Key
            }
        };
        let key_path = match &req.auth {
            NewServerAuth::Key { key_path, .. } => Some(key_path.clone()),
            NewServerAuth::Password(_) => None,
        };

        let record = ServerRecord {
            id: id.clone(),
            name: req.name,
            host: req.host,
            ssh_port: req.ssh_port,
            username: req.username,
            auth_type,
            socks_port: req.socks_port,
            key_path,
            proxy_username: req.proxy_username,
            proxy_password: req.proxy_password,
            auto_reconnect: req.auto_reconnect,
            connect_on_startup: req.connect_on_startup,
            notifications_enabled: req.notifications_enabled,
            is_enabled: false,
        };

        self.inner.servers.write().await.push(record);
        self.persist().await;
        self.inner.events.publish(Event::server_added(&id));
        self.push_log("(new server)", LogKind::Info, Some("server added".into()));

        Ok(id)
    }

    pub async fn update_server(&self, id: &str, patch: ServerPatch) -> Result<(), ManagerError> {
        let was_connected = {
            let workers = self.inner.workers.read().await;
            workers.get(id).map(|e| e.current.read().state() == WorkerState::Connected).unwrap_or(false)
        };

        let mut port_changed = false;
        {
            let mut servers = self.inner.servers.write().await;
            let record = servers.iter_mut().find(|s| s.id == id).ok_or_else(|| ManagerError::ServerNotFound(id.to_string()))?;

            if let Some(name) = patch.name {
                record.name = name;
            }
            if let Some(host) = patch.host {
                record.host = host;
            }
            if let Some(ssh_port) = patch.ssh_port {
                record.ssh_port = ssh_port;
            }
            if let Some(username) = patch.username {
                record.username = username;
            }
            if let Some(socks_port) = patch.socks_port {
                if socks_port != record.socks_port {
                    port_changed = true;
                }
                record.socks_port = socks_port;
            }
            if let Some(proxy_username) = patch.proxy_username {
                record.proxy_username = proxy_username;
            }
            if let Some(proxy_password) = patch.proxy_password {
                record.proxy_password = proxy_password;
            }
            if let Some(auto_reconnect) = patch.auto_reconnect {
                record.auto_reconnect = auto_reconnect;
            }
            if let Some(connect_on_startup) = patch.connect_on_startup {
                record.connect_on_startup = connect_on_startup;
            }
            if let Some(notifications_enabled) = patch.notifications_enabled {
                record.notifications_enabled = notifications_enabled;
            }
            if let Some(is_enabled) = patch.is_enabled {
                record.is_enabled = is_enabled;
            }
        }

        if let Some(password) = patch.new_password {
            self.inner.secret_store.put(&format!("password_{id}"), password.as_bytes()).await.ok();
        }
        if let Some((key_path, passphrase)) = patch.new_key {
            {
                let mut servers = self.inner.servers.write().await;
                if let Some(record) = servers.iter_mut().find(|s| s.id == id) {
                    record.key_path = Some(key_path);
                    record.auth_type = AuthType::Key;
                }
            }
            if let Some(passphrase) = passphrase {
                self.inner.secret_store.put(&format!("keyPassphrase_{id}"), passphrase.as_bytes()).await.ok();
            }
        }

        self.persist().await;

        // "running tunnel is transparently rebound if socksPort changes" (spec.md §4.12).
        if port_changed && was_connected {
            self.disconnect_internal(id, "api_disconnect").await;
            let _ = self.connect(id).await;
        }

        Ok(())
    }

    pub async fn delete_server(&self, id: &str) -> Result<(), ManagerError> {
        self.disconnect_internal(id, "server_deleted").await;
        self.inner.workers.write().await.remove(id);
        self.inner.passive.write().await.remove(id);
        self.unmark_owned(id).await;

        {
            let mut servers = self.inner.servers.write().await;
            let before = servers.len();
            servers.retain(|s| s.id != id);
            if servers.len() == before {
                return Err(ManagerError::ServerNotFound(id.to_string()));
            }
        }
        self.inner.profiles.write().await.retain(|p| p.server_id != id);

        self.inner.secret_store.delete(&format!("password_{id}")).await.ok();
        self.inner.secret_store.delete(&format!("keyPassphrase_{id}")).await.ok();
        self.inner.stats_store.delete_server(id).await?;

        self.persist().await;
        self.inner.events.publish(Event::server_deleted(id));
        Ok(())
    }

    // --- connect / disconnect ----------------------------------------------

    async fn build_ssh_config(&self, server: &ServerRecord) -> (SshConfig, Option<ProxyAuth>) {
        let auth = match server.auth_type {
            AuthType::Password => {
                let password = self
                    .inner
                    .secret_store
                    .get(&format!("password_{}", server.id))
                    .await
                    .and_then(|b| String::from_utf8(b).ok())
                    .unwrap_or_default();
                AuthMethod::password(password)
            }
            AuthType::Key => {
                let passphrase = self
                    .inner
                    .secret_store
                    .get(&format!("keyPassphrase_{}", server.id))
                    .await
                    .and_then(|b| String::from_utf8(b).ok());
                AuthMethod::key(server.key_path.clone().unwrap_or_default(), passphrase)
            }
        };

        let ssh_config = SshConfig {
            host: server.host.clone(),
            port: server.ssh_port,
            username: server.username.clone(),
            auth,
            timeout_secs: 15,
            strict_host_key_checking: false,
            trust_host_key: Some(true),
        };

        let proxy_auth = if server.requires_proxy_auth() {
            Some(ProxyAuth {
                username: server.proxy_username.clone().unwrap(),
                password: server.proxy_password.clone().unwrap(),
            })
        } else {
            None
        };

        (ssh_config, proxy_auth)
    }

    /// Starts (or no-ops if already running) the Worker+Reconnect Scheduler
    /// supervisor for `server_id`.
    pub async fn connect(&self, server_id: &str) -> Result<(), ManagerError> {
        {
            let workers = self.inner.workers.read().await;
            if let Some(entry) = workers.get(server_id) {
                if entry.current.read().state() != WorkerState::Terminated
                    && entry.current.read().state() != WorkerState::Failed
                {
                    return Ok(()); // already running
                }
            }
        }
        self.inner.passive.write().await.remove(server_id);

        let mut server = self.find_server(server_id).await?;
        if !server.is_enabled {
            // isEnabled is "was-commanded-on; survives restarts" (spec.md
            // §3) — connecting is the command, so flip and persist it here
            // rather than only via an explicit PUT /servers/{id} patch.
            server.is_enabled = true;
            let mut servers = self.inner.servers.write().await;
            if let Some(record) = servers.iter_mut().find(|s| s.id == server_id) {
                record.is_enabled = true;
            }
            drop(servers);
            self.persist().await;
        }
        let (ssh_config, proxy_auth) = self.build_ssh_config(&server).await;

        let (control_tx, control_rx) = watch::channel(None::<String>);
        let shared = WorkerShared::new();
        let handle = WorkerHandle { shared: shared.clone(), control_tx };

        let entry = Arc::new(WorkerEntry {
            current: parking_lot::RwLock::new(handle),
            reconnect: ReconnectTimer::new(),
            supervisor: tokio::sync::Mutex::new(None),
            total_uptime: AtomicU64::new(0),
            reconnect_count: AtomicU32::new(0),
            latency_ms: parking_lot::Mutex::new(None),
            last_keepalive_at: parking_lot::Mutex::new(None),
            display_name: parking_lot::Mutex::new(server.name.clone()),
            socks_port: AtomicU16::new(server.socks_port),
        });

        self.inner.workers.write().await.insert(server_id.to_string(), entry.clone());

        let manager = self.clone();
        let server_id_owned = server_id.to_string();
        let join = tokio::spawn(async move {
            run_supervisor(manager, server, ssh_config, proxy_auth, entry, shared, control_rx).await;
            // unreachable in the Some(entry) branch below since entry owns
            // the JoinHandle; kept for clarity of the move closure's shape.
            let _ = server_id_owned;
        });

        if let Some(entry) = self.inner.workers.read().await.get(server_id) {
            *entry.supervisor.lock().await = Some(join);
        }

        Ok(())
    }

    async fn disconnect_internal(&self, server_id: &str, reason: &str) {
        let workers = self.inner.workers.read().await;
        if let Some(entry) = workers.get(server_id) {
            entry.reconnect.cancel();
            entry.current.read().request_disconnect(reason);
        }
    }

    pub async fn disconnect(&self, server_id: &str) -> Result<(), ManagerError> {
        self.find_server(server_id).await?;
        {
            let mut servers = self.inner.servers.write().await;
            if let Some(record) = servers.iter_mut().find(|s| s.id == server_id) {
                record.is_enabled = false;
            }
        }
        self.persist().await;
        self.disconnect_internal(server_id, "api_disconnect").await;
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.inner.workers.read().await.keys().cloned().collect();
        for id in ids {
            self.disconnect_internal(&id, "api_disconnect_all").await;
        }
    }

    /// Called from the shutdown path: disconnect everything and wait
    /// briefly for supervisors to wind down.
    pub async fn stop_all(&self) {
        self.disconnect_all().await;
        let supervisors: Vec<_> = {
            let workers = self.inner.workers.read().await;
            workers.values().cloned().collect()
        };
        for entry in supervisors {
            let join = entry.supervisor.lock().await.take();
            if let Some(join) = join {
                let _ = tokio::time::timeout(std::time::Duration::from_secs(3), join).await;
            }
        }
    }

    // --- tunnels / health ----------------------------------------------------

    pub async fn internal_workers(&self) -> Vec<(String, WorkerHandle)> {
        self.inner
            .workers
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.current.read().clone()))
            .collect()
    }

    pub async fn record_health_sample(&self, server_id: &str, latency_ms: Option<u64>) {
        let now = chrono::Utc::now().timestamp_millis();
        let (bytes_in, bytes_out, uptime) = {
            let workers = self.inner.workers.read().await;
            let Some(entry) = workers.get(server_id) else { return };
            *entry.latency_ms.lock() = latency_ms;
            *entry.last_keepalive_at.lock() = Some(now);
            let handle = entry.current.read().clone();
            let (bi, bo) = handle.bytes();
            let uptime = handle.connected_at().map(|t| ((now - t).max(0) / 1000) as u64).unwrap_or(0);
            (bi, bo, uptime)
        };
        self.inner.events.publish(Event::stats(server_id, uptime, bytes_in, bytes_out, latency_ms));
    }

    pub async fn register_external(&self, server_id: &str, name: &str, port: u16, proxy_type: ProxyType, auth: AdvertisedAuth) {
        let tunnel = ActiveTunnel {
            server_id: server_id.to_string(),
            display_name: name.to_string(),
            socks_port: port,
            started_at: chrono::Utc::now().timestamp_millis(),
            is_external: true,
            proxy_type,
            advertised_auth: auth,
            bytes_in: 0,
            bytes_out: 0,
            reconnect_count: 0,
            total_uptime: 0,
            latency_ms: None,
            last_keepalive_at: None,
        };
        self.inner.passive.write().await.insert(server_id.to_string(), tunnel);
    }

    async fn mark_adopted(&self, server_id: &str, name: &str, port: u16) {
        let tunnel = ActiveTunnel {
            server_id: server_id.to_string(),
            display_name: name.to_string(),
            socks_port: port,
            started_at: chrono::Utc::now().timestamp_millis(),
            is_external: false,
            proxy_type: ProxyType::Unknown,
            advertised_auth: AdvertisedAuth::Unknown,
            bytes_in: 0,
            bytes_out: 0,
            reconnect_count: 0,
            total_uptime: 0,
            latency_ms: None,
            last_keepalive_at: None,
        };
        self.inner.passive.write().await.insert(server_id.to_string(), tunnel);
    }

    pub async fn list_tunnels(&self) -> Vec<ActiveTunnel> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut out = Vec::new();
        {
            let workers = self.inner.workers.read().await;
            for (id, entry) in workers.iter() {
                if let Some(tunnel) = entry.snapshot(id, now) {
                    out.push(tunnel);
                }
            }
        }
        out.extend(self.inner.passive.read().await.values().cloned());
        out
    }

    /// Socks ports already accounted for (configured servers plus anything
    /// currently tracked), used by the Port Scanner to skip our own tunnels.
    pub async fn known_socks_ports(&self) -> HashSet<u16> {
        let mut ports: HashSet<u16> = self.inner.servers.read().await.iter().map(|s| s.socks_port).collect();
        ports.extend(self.inner.passive.read().await.values().map(|t| t.socks_port));
        ports
    }

    pub fn scan_progress(&self) -> ScanProgress {
        *self.inner.scan_progress.lock()
    }

    /// Kicks off a Port Scanner sweep in the background (spec.md §4.10).
    pub async fn trigger_scan(&self) {
        {
            let mut progress = self.inner.scan_progress.lock();
            if progress.running {
                return;
            }
            *progress = ScanProgress { scanned: 0, total: 65535, running: true };
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let known = manager.known_socks_ports().await;
            let findings = scanner::scan_all_ports(&known, |scanned, total| {
                *manager.inner.scan_progress.lock() = ScanProgress { scanned, total, running: true };
            })
            .await;

            for finding in findings {
                let server_id = format!("ext_{}", finding.port);
                manager
                    .register_external(&server_id, &server_id, finding.port, finding.proxy_type, finding.advertised_auth)
                    .await;
            }

            manager.inner.scan_progress.lock().running = false;
        });
    }

    // --- stats --------------------------------------------------------------

    pub async fn query_stats(&self, server_id: &str, period: Period) -> Result<crate::stats::StatsQueryResult, ManagerError> {
        let now = chrono::Utc::now().timestamp_millis();
        Ok(self.inner.stats_store.query(server_id, period, now).await?)
    }

    /// Spawns a task that deletes stats rows past the 7-day retention
    /// window (spec.md §4.4) once a day for the life of the process.
    pub fn spawn_stats_cleanup(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(24 * 3600));
            ticker.tick().await; // first tick is immediate; skip it
            loop {
                ticker.tick().await;
                let now = chrono::Utc::now().timestamp_millis();
                match manager.inner.stats_store.cleanup(now).await {
                    Ok(deleted) => info!(deleted, "stats store: retention cleanup"),
                    Err(e) => warn!("stats store: retention cleanup failed: {}", e),
                }
            }
        });
    }

    // --- profiles -------------------------------------------------------------

    pub async fn list_profiles(&self) -> Vec<QuickProfile> {
        self.inner.profiles.read().await.clone()
    }

    pub async fn add_profile(&self, server_id: &str, display_name: &str, socks_port_override: Option<u16>) -> Result<String, ManagerError> {
        self.find_server(server_id).await?;
        let id = uuid::Uuid::new_v4().to_string();
        self.inner.profiles.write().await.push(QuickProfile {
            id: id.clone(),
            server_id: server_id.to_string(),
            display_name: display_name.to_string(),
            socks_port_override,
        });
        self.persist().await;
        Ok(id)
    }

    pub async fn delete_profile(&self, id: &str) -> Result<(), ManagerError> {
        let mut profiles = self.inner.profiles.write().await;
        let before = profiles.len();
        profiles.retain(|p| p.id != id);
        if profiles.len() == before {
            return Err(ManagerError::ProfileNotFound(id.to_string()));
        }
        drop(profiles);
        self.persist().await;
        Ok(())
    }

    /// Launches a profile's server, overriding its socksPort if the profile
    /// specifies one (spec.md §3: "Launching a profile uses its socksPort
    /// in place of the server's default").
    pub async fn connect_profile(&self, id: &str) -> Result<(), ManagerError> {
        let profile = self
            .inner
            .profiles
            .read()
            .await
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| ManagerError::ProfileNotFound(id.to_string()))?;

        if let Some(port) = profile.socks_port_override {
            let mut servers = self.inner.servers.write().await;
            if let Some(record) = servers.iter_mut().find(|s| s.id == profile.server_id) {
                record.socks_port = port;
            }
            drop(servers);
            self.persist().await;
        }

        self.connect(&profile.server_id).await
    }

    // --- import / export ------------------------------------------------------

    pub async fn export(&self, include_keys: bool) -> serde_json::Value {
        let servers = self.inner.servers.read().await.clone();
        let mut exported = Vec::with_capacity(servers.len());

        for server in &servers {
            let mut value = serde_json::to_value(server).unwrap_or(serde_json::Value::Null);
            if include_keys {
                if let Some(obj) = value.as_object_mut() {
                    if let Some(password) = self.inner.secret_store.get(&format!("password_{}", server.id)).await {
                        if let Ok(s) = String::from_utf8(password) {
                            obj.insert("password".into(), serde_json::Value::String(s));
                        }
                    }
                    if let Some(passphrase) = self.inner.secret_store.get(&format!("keyPassphrase_{}", server.id)).await {
                        if let Ok(s) = String::from_utf8(passphrase) {
                            obj.insert("keyPassphrase".into(), serde_json::Value::String(s));
                        }
                    }
                }
            }
            exported.push(value);
        }

        serde_json::json!({
            "servers": exported,
            "exportedAt": chrono::Utc::now().to_rfc3339(),
            "count": exported.len(),
            "includesKeys": include_keys,
        })
    }

    /// Imports servers, deduping against existing ones by (host, username,
    /// sshPort) as spec.md §6 requires. Accepts either a bare array or
    /// `{servers:[...]}`, left to the caller (Control API) to normalize
    /// before calling this.
    pub async fn import(&self, servers: Vec<serde_json::Value>) -> Result<usize, ManagerError> {
        let existing: HashSet<(String, String, u16)> = self.inner.servers.read().await.iter().map(|s| s.dedup_key()).collect();
        let mut imported = 0usize;

        for value in servers {
            let Ok(mut record) = serde_json::from_value::<ServerRecord>(value.clone()) else {
                continue;
            };
            let key = record.dedup_key();
            if existing.contains(&key) {
                continue;
            }

            let password = value.get("password").and_then(|v| v.as_str()).map(|s| s.to_string());
            let passphrase = value.get("keyPassphrase").and_then(|v| v.as_str()).map(|s| s.to_string());

            record.id = uuid::Uuid::new_v4().to_string();
            record.is_enabled = false;

            if let Some(password) = password {
                self.inner.secret_store.put(&format!("password_{}", record.id), password.as_bytes()).await.ok();
            }
            if let Some(passphrase) = passphrase {
                self.inner.secret_store.put(&format!("keyPassphrase_{}", record.id), passphrase.as_bytes()).await.ok();
            }

            self.inner.servers.write().await.push(record);
            imported += 1;
        }

        if imported > 0 {
            self.persist().await;
        }
        Ok(imported)
    }
}

/// Reconnect Scheduler (C7) supervisor loop for one server: runs the
/// Worker to completion, records a stats sample, and — if the outcome is
/// retryable and autoReconnect is set — waits out the backoff delay before
/// trying again. Cancellation (user disconnect, server delete) interrupts
/// the backoff wait via `ReconnectTimer::cancel`.
async fn run_supervisor(
    manager: TunnelManager,
    server: ServerRecord,
    ssh_config: SshConfig,
    proxy_auth: Option<ProxyAuth>,
    entry: Arc<WorkerEntry>,
    first_shared: Arc<WorkerShared>,
    first_control_rx: watch::Receiver<Option<String>>,
) {
    let server_id = server.id.clone();
    let mut shared = first_shared;
    let mut control_rx = first_control_rx;
    let mut has_connected_once = false;

    loop {
        let outcome = worker::run_once(server.clone(), ssh_config.clone(), proxy_auth.clone(), manager.clone(), shared.clone(), control_rx.clone(), has_connected_once).await;

        let reconnect_count_now = entry.reconnect_count.load(Ordering::Relaxed);
        let sample = StatsSample {
            server_id: server_id.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            uptime_sec: outcome.uptime_secs,
            bytes_in: outcome.bytes_in,
            bytes_out: outcome.bytes_out,
            latency_ms: *entry.latency_ms.lock(),
            reconnect_count: reconnect_count_now,
            disconnect_reason: Some(outcome.reason.clone()),
        };
        if let Err(e) = manager.inner.stats_store.insert_sample(sample).await {
            warn!(server_id, "failed to record stats sample: {}", e);
        }

        let is_adoption = outcome.reason == "adopted_existing";
        if is_adoption {
            manager.mark_adopted(&server_id, &server.name, server.socks_port).await;
            manager.push_log(&server.name, LogKind::Connected, Some("adopted existing tunnel".into()));
        } else if outcome.reached_connected {
            entry.total_uptime.fetch_add(outcome.uptime_secs, Ordering::Relaxed);
            if has_connected_once {
                manager.push_log(&server.name, LogKind::Reconnected, None);
            } else {
                manager.push_log(&server.name, LogKind::Connected, None);
            }
            has_connected_once = true;
            manager.push_log(&server.name, LogKind::Disconnected, Some(outcome.reason.clone()));
        } else {
            manager.push_log(&server.name, LogKind::Error, Some(outcome.reason.clone()));
        }

        if !outcome.retryable || !server.auto_reconnect {
            break;
        }

        let peeked_attempt = entry.reconnect.attempt();
        let next_retry_ms = backoff_delay(peeked_attempt).as_millis() as u64;
        manager.inner.events.publish(Event::reconnecting(&server_id, peeked_attempt + 1, next_retry_ms));
        manager.push_log(&server.name, LogKind::Info, Some(format!("reconnecting, attempt {}", peeked_attempt + 1)));

        if entry.reconnect.wait_next(&server_id).await.is_none() {
            break;
        }

        let (control_tx, next_control_rx) = watch::channel(None::<String>);
        let next_shared = WorkerShared::new();
        *entry.current.write() = WorkerHandle { shared: next_shared.clone(), control_tx };
        shared = next_shared;
        control_rx = next_control_rx;
    }

    info!(server_id, "worker supervisor exiting");
    manager.inner.workers.write().await.remove(&server_id);
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStorage, SecretStore};
    use crate::stats::StatsStore;
    use tempfile::tempdir;

    async fn test_manager() -> (TunnelManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config_storage = ConfigStorage::with_path(dir.path().join("servers.json"));
        let secret_store = SecretStore::new(dir.path());
        let stats_store = StatsStore::open(dir.path().join("stats.redb")).unwrap();
        let manager = TunnelManager::init(config_storage, secret_store, stats_store).await.unwrap();
        (manager, dir)
    }

    #[tokio::test]
    async fn add_server_assigns_id_and_persists() {
        let (manager, _dir) = test_manager().await;
        let id = manager
            .add_server(NewServer {
                name: "S".into(),
                host: "127.0.0.1".into(),
                ssh_port: 22,
                username: "u".into(),
                auth: NewServerAuth::Password("p".into()),
                socks_port: 11080,
                proxy_username: None,
                proxy_password: None,
                auto_reconnect: true,
                connect_on_startup: false,
                notifications_enabled: true,
            })
            .await
            .unwrap();

        let servers = manager.list_servers().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, id);
        assert_eq!(servers[0].socks_port, 11080);
    }

    #[tokio::test]
    async fn add_server_rejects_zero_ports() {
        let (manager, _dir) = test_manager().await;
        let result = manager
            .add_server(NewServer {
                name: "S".into(),
                host: "127.0.0.1".into(),
                ssh_port: 22,
                username: "u".into(),
                auth: NewServerAuth::Password("p".into()),
                socks_port: 0,
                proxy_username: None,
                proxy_password: None,
                auto_reconnect: true,
                connect_on_startup: false,
                notifications_enabled: true,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn delete_unknown_server_errors() {
        let (manager, _dir) = test_manager().await;
        let result = manager.delete_server("nonexistent").await;
        assert!(matches!(result, Err(ManagerError::ServerNotFound(_))));
    }

    #[tokio::test]
    async fn owned_set_round_trips_through_persistence() {
        let (manager, dir) = test_manager().await;
        manager.mark_owned("s1").await;
        assert!(manager.is_owned("s1").await);

        let config_storage = ConfigStorage::with_path(dir.path().join("servers.json"));
        let secret_store = SecretStore::new(dir.path());
        let stats_store = StatsStore::open(dir.path().join("stats2.redb")).unwrap();
        let reloaded = TunnelManager::init(config_storage, secret_store, stats_store).await.unwrap();
        assert!(reloaded.is_owned("s1").await);
    }

    #[tokio::test]
    async fn export_without_keys_omits_secrets() {
        let (manager, _dir) = test_manager().await;
        manager
            .add_server(NewServer {
                name: "S".into(),
                host: "127.0.0.1".into(),
                ssh_port: 22,
                username: "u".into(),
                auth: NewServerAuth::Password("hunter2".into()),
                socks_port: 11080,
                proxy_username: None,
                proxy_password: None,
                auto_reconnect: true,
                connect_on_startup: false,
                notifications_enabled: true,
            })
            .await
            .unwrap();

        let exported = manager.export(false).await;
        let json = exported.to_string();
        assert!(!json.contains("hunter2"));
    }

    /// S5 (spec.md §4.7/§8): `reconnectCount` must be visible the instant
    /// the reconnected session goes live, not only once it later ends.
    #[tokio::test]
    async fn reconnect_success_is_visible_before_session_ends() {
        let (manager, _dir) = test_manager().await;
        let id = manager
            .add_server(NewServer {
                name: "S".into(),
                host: "127.0.0.1".into(),
                ssh_port: 1,
                username: "u".into(),
                auth: NewServerAuth::Password("p".into()),
                socks_port: 11082,
                proxy_username: None,
                proxy_password: None,
                auto_reconnect: true,
                connect_on_startup: false,
                notifications_enabled: true,
            })
            .await
            .unwrap();

        manager.connect(&id).await.unwrap();

        // Simulate the worker re-entering CONNECTED mid-session, as `run_once`
        // does internally when `is_reconnect` is set, before the session has
        // had any chance to terminate.
        manager.note_reconnect_success(&id).await;

        let count = manager
            .inner
            .workers
            .read()
            .await
            .get(&id)
            .unwrap()
            .reconnect_count
            .load(Ordering::Relaxed);
        assert_eq!(count, 1);

        manager.disconnect(&id).await.unwrap();
    }

    /// spec.md §3: isEnabled is "was-commanded-on; survives restarts" — the
    /// normal connect/disconnect API path must set it, not just the PUT
    /// /servers/{id} patch.
    #[tokio::test]
    async fn connect_and_disconnect_toggle_is_enabled() {
        let (manager, _dir) = test_manager().await;
        let id = manager
            .add_server(NewServer {
                name: "S".into(),
                host: "127.0.0.1".into(),
                ssh_port: 1,
                username: "u".into(),
                auth: NewServerAuth::Password("p".into()),
                socks_port: 11083,
                proxy_username: None,
                proxy_password: None,
                auto_reconnect: true,
                connect_on_startup: false,
                notifications_enabled: true,
            })
            .await
            .unwrap();

        let server = manager.list_servers().await.into_iter().find(|s| s.id == id).unwrap();
        assert!(!server.is_enabled);

        manager.connect(&id).await.unwrap();
        let server = manager.list_servers().await.into_iter().find(|s| s.id == id).unwrap();
        assert!(server.is_enabled);

        manager.disconnect(&id).await.unwrap();
        let server = manager.list_servers().await.into_iter().find(|s| s.id == id).unwrap();
        assert!(!server.is_enabled);
    }
}
