//! tunnelmgrd — entry point.
//!
//! Wires the Config/Secret/Stats stores into a [`TunnelManager`], runs its
//! init barrier (spec.md §4.11: loadApiAuth → loadServers → loadProfiles →
//! open barrier), then starts the background tasks (Health Monitor,
//! Network Watcher) and the Control API before handing control to
//! `axum::serve` with graceful shutdown on SIGINT/SIGTERM.
//!
//! Grounded on the SchirmForge daemon's `main.rs` for the overall shape
//! (umask-then-log-then-load-then-serve, `wait_for_shutdown` stopping every
//! tunnel before the process exits) and on the teacher's `lib.rs::run` for
//! the registry-construction-then-wire-together order — adapted from that
//! daemon's Unix-socket/TLS listener modes (this crate carries neither
//! `axum_server` nor `hyper_util`) to the plain `axum::serve` path over a
//! `tokio::net::TcpListener`, with the configured/fallback-port retry loop
//! spec.md §4.12 asks for in place of SchirmForge's single bind attempt.

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use tunnelmgrd::api::{create_router, AppState};
use tunnelmgrd::config::{config_dir, stats_db_path, ConfigStorage, SecretStore};
use tunnelmgrd::stats::StatsStore;
use tunnelmgrd::tunnel::{network_watcher, TunnelManager};

/// Primary Control API port (spec.md §4.12).
const DEFAULT_PORT: u16 = 7070;
/// Fallback port tried if [`DEFAULT_PORT`] is busy.
const FALLBACK_PORT: u16 = 7071;
/// Retry budget once both ports are busy.
const BIND_RETRIES: u32 = 5;
const BIND_RETRY_SPACING: std::time::Duration = std::time::Duration::from_secs(2);

#[tokio::main]
async fn main() {
    set_restrictive_umask();
    tunnelmgrd::init_logging();

    info!("tunnelmgrd {} starting", env!("CARGO_PKG_VERSION"));

    let config_dir = match config_dir() {
        Ok(dir) => dir,
        Err(e) => {
            error!("failed to determine config directory: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&config_dir) {
        error!("failed to create config directory {:?}: {}", config_dir, e);
        std::process::exit(1);
    }

    let config_storage = match ConfigStorage::new() {
        Ok(s) => s,
        Err(e) => {
            error!("failed to initialize config store: {}", e);
            std::process::exit(1);
        }
    };
    let secret_store = SecretStore::new(&config_dir);
    let stats_path = match stats_db_path() {
        Ok(p) => p,
        Err(e) => {
            error!("failed to determine stats db path: {}", e);
            std::process::exit(1);
        }
    };
    let stats_store = match StatsStore::open(&stats_path) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to open stats store at {:?}: {}", stats_path, e);
            std::process::exit(1);
        }
    };

    // Init sequence barrier (spec.md §4.11): nothing below this point races
    // a concurrent mutating call, since the Control API hasn't started yet.
    let manager = match TunnelManager::init(config_storage, secret_store, stats_store).await {
        Ok(m) => m,
        Err(e) => {
            error!("failed to initialize tunnel manager: {}", e);
            std::process::exit(1);
        }
    };
    manager.ensure_api_token().await;
    if manager.api_auth_enabled() {
        info!("API authentication enabled");
    } else {
        info!("API authentication disabled — endpoints are unauthenticated");
    }

    // Held for the process lifetime: see `spawn_background_tasks` doc comment.
    let _online_tx = spawn_background_tasks(manager.clone());
    connect_eligible_on_startup(&manager).await;
    manager.spawn_stats_cleanup();

    let (listener, port) = match bind_with_fallback().await {
        Some(pair) => pair,
        None => {
            // Fatal only for the control plane (spec.md §7); the tunnel
            // engine keeps running headlessly.
            error!(
                "failed to bind both port {} and fallback port {} after {} retries; \
                 control API disabled, tunnel engine continues headlessly",
                DEFAULT_PORT, FALLBACK_PORT, BIND_RETRIES
            );
            wait_for_shutdown(manager).await;
            return;
        }
    };

    info!("control API listening on 0.0.0.0:{}", port);
    let state = AppState::new(manager.clone(), port);
    let app = create_router(state);

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(manager))
        .await;

    if let Err(e) = serve_result {
        error!("control API server error: {}", e);
    }
    info!("tunnelmgrd shut down");
}

/// Restrict the process umask before any of the stores below create a file,
/// so config/secret/stats files never land world-readable.
#[cfg(unix)]
fn set_restrictive_umask() {
    use nix::sys::stat::{umask, Mode};
    umask(Mode::from_bits_truncate(0o077));
}

#[cfg(not(unix))]
fn set_restrictive_umask() {}

/// Health Monitor (C8) and Network Watcher (C9); the Reconnect Scheduler
/// (C7) runs inline inside each worker's supervisor task, spawned by
/// `TunnelManager::connect`, so it needs no separate task here.
///
/// Returns the Network Watcher's transition sender. The OS-level
/// connectivity notifier is out of scope (spec.md §1); the caller holds
/// this sender open for the process lifetime so the watcher's `rx.recv()`
/// loop never observes a spurious close. A future host integration would
/// feed online/offline transitions in through it.
fn spawn_background_tasks(manager: TunnelManager) -> tokio::sync::mpsc::Sender<network_watcher::NetworkTransition> {
    tokio::spawn(tunnelmgrd::tunnel::health::run(manager.clone()));

    let (online_tx, online_rx) = tokio::sync::mpsc::channel::<network_watcher::NetworkTransition>(8);
    tokio::spawn(network_watcher::run(manager, online_rx));
    online_tx
}

/// Startup leg of spec.md §4.9's eligibility rule (`isEnabled ∨
/// connectOnStartup`), run once before the barrier opens to the API.
async fn connect_eligible_on_startup(manager: &TunnelManager) {
    for server in manager.list_servers().await {
        if server.is_enabled || server.connect_on_startup {
            info!(server_id = %server.id, "connecting on startup");
            if let Err(e) = manager.connect(&server.id).await {
                warn!(server_id = %server.id, "startup connect failed: {}", e);
            }
        }
    }
}

/// Binds [`DEFAULT_PORT`], then [`FALLBACK_PORT`], retrying both up to
/// [`BIND_RETRIES`] times at [`BIND_RETRY_SPACING`] apart (spec.md §4.12).
async fn bind_with_fallback() -> Option<(TcpListener, u16)> {
    for attempt in 0..=BIND_RETRIES {
        for port in [DEFAULT_PORT, FALLBACK_PORT] {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => return Some((listener, port)),
                Err(e) => warn!("bind 0.0.0.0:{} failed (attempt {}): {}", port, attempt + 1, e),
            }
        }
        if attempt < BIND_RETRIES {
            tokio::time::sleep(BIND_RETRY_SPACING).await;
        }
    }
    None
}

/// Waits for Ctrl+C or SIGTERM, then stops every tunnel before returning.
async fn wait_for_shutdown(manager: TunnelManager) {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received Ctrl+C, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C, shutting down");
    }

    manager.stop_all().await;
    info!("all tunnels stopped");
}
