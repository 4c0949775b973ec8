//! tunnelmgrd — SSH tunnel fleet manager daemon.
//!
//! Owns a fleet of outbound SSH connections, each exposing a local SOCKS5
//! proxy whose CONNECT requests ride the SSH session as direct-tcpip
//! channels, plus an HTTP/WebSocket control plane for lifecycle management.

// High-performance allocator — reduces fragmentation under the daemon's
// high-frequency small allocations (per-connection buffers, event frames).
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod api;
pub mod config;
pub mod events;
pub mod socks;
pub mod ssh;
pub mod stats;
pub mod tunnel;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global `tracing` subscriber, driven by `RUST_LOG` with a
/// default of `info`.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
