//! Tunnel lifecycle engine: the Tunnel Worker (C6) state machine, the
//! Reconnect Scheduler (C7), the Health Monitor (C8), the Network Watcher
//! (C9), the Port Scanner (C10), and the Tunnel Manager (C11) that
//! orchestrates all of them.

pub mod health;
pub mod manager;
pub mod network_watcher;
pub mod reconnect;
pub mod scanner;
pub mod worker;

pub use manager::{ManagerError, TunnelManager};
pub use worker::{WorkerHandle, WorkerState};

use serde::{Deserialize, Serialize};

/// Classify an `isExternal=false` tunnel's local SOCKS5 listener's advertised
/// proxy kind (spec.md §3; populated for externally-discovered tunnels by
/// the Port Scanner, `Unknown` for tunnels this process owns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyType {
    Socks5,
    Socks4,
    Http,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertisedAuth {
    NoAuth,
    UserPass,
    Unknown,
}

/// In-memory record of one live tunnel (spec.md §3). Owned and mutated by
/// the Manager; counters are updated by the Worker via shared atomics and
/// folded back in on each snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTunnel {
    pub server_id: String,
    pub display_name: String,
    pub socks_port: u16,
    /// Epoch milliseconds; monotonic enough for this process's lifetime
    /// since the daemon never has its wall clock rewound mid-session in
    /// practice, and uptime accounting tolerates small clock skew.
    pub started_at: i64,
    pub is_external: bool,
    pub proxy_type: ProxyType,
    pub advertised_auth: AdvertisedAuth,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub reconnect_count: u32,
    pub total_uptime: u64,
    pub latency_ms: Option<u64>,
    pub last_keepalive_at: Option<i64>,
}

impl ActiveTunnel {
    pub fn uptime_secs(&self, now_ms: i64) -> u64 {
        ((now_ms - self.started_at).max(0) / 1000) as u64
    }
}

const MAX_REASON_DETAIL_LEN: usize = 100;

fn truncate_detail(raw: &str) -> String {
    if raw.chars().count() <= MAX_REASON_DETAIL_LEN {
        raw.to_string()
    } else {
        raw.chars().take(MAX_REASON_DETAIL_LEN).collect()
    }
}

/// Classify a raw error string into one of spec.md §7's reason tags via
/// keyword matching. `fallback_ssh` distinguishes a failure that occurred
/// inside the SSH dial/auth path (`ssh_error:<detail>`) from one elsewhere
/// (`unknown:<detail>`) — the Design Notes §9 Open Question on typed-error
/// classification is resolved in favor of keeping this simple, since russh's
/// error surface does not expose a stable typed taxonomy across DNS/refused/
/// timeout/reset (see DESIGN.md).
pub fn classify_reason(raw: &str, fallback_ssh: bool) -> String {
    let lower = raw.to_lowercase();

    if lower.contains("auth") {
        "auth_failed".to_string()
    } else if lower.contains("refused") {
        "connection_refused".to_string()
    } else if lower.contains("dns") || lower.contains("resolve") || lower.contains("name or service") {
        format!("dns_error:{}", truncate_detail(raw))
    } else if lower.contains("timed out") || lower.contains("timeout") {
        "socket_timeout".to_string()
    } else if lower.contains("reset") || lower.contains("closed") || lower.contains("eof") || lower.contains("broken pipe") {
        "remote_closed".to_string()
    } else if fallback_ssh {
        format!("ssh_error:{}", truncate_detail(raw))
    } else {
        format!("unknown:{}", truncate_detail(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_keywords() {
        assert_eq!(classify_reason("Authentication failed", false), "auth_failed");
        assert_eq!(classify_reason("Connection refused (os error 111)", false), "connection_refused");
        assert_eq!(classify_reason("Connection timed out", false), "socket_timeout");
        assert_eq!(classify_reason("connection reset by peer", false), "remote_closed");
        assert!(classify_reason("could not resolve host example.invalid", false).starts_with("dns_error:"));
    }

    #[test]
    fn unknown_falls_back_per_context() {
        assert!(classify_reason("some other weirdness", false).starts_with("unknown:"));
        assert!(classify_reason("some other weirdness", true).starts_with("ssh_error:"));
    }

    #[test]
    fn detail_truncated_to_100_chars() {
        let long = "x".repeat(500);
        let reason = classify_reason(&long, true);
        let detail = reason.strip_prefix("ssh_error:").unwrap();
        assert_eq!(detail.chars().count(), 100);
    }
}
