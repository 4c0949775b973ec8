//! Persisted data model for the Config Store (C2): [`ServerRecord`] and
//! [`QuickProfile`], plus the on-disk [`ConfigFile`] envelope.
//!
//! Secrets are never part of this type graph — password/private-key/
//! passphrase material lives exclusively in the Secret Store (C1), keyed by
//! `{password,privateKey,keyPassphrase}_{id}`.

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Password,
    Key,
}

/// A configured SSH server/tunnel endpoint (no secrets).
///
/// camelCase on the wire to match the Control API's request DTOs
/// (`NewServerRequest`/`ServerPatchRequest` in `api::handlers`) — `GET
/// /servers`, `/export`, and `/import` all serialize/deserialize this type
/// directly, so a client reading `GET /servers` and resubmitting it as an
/// import must see the same casing both ways.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub username: String,
    pub auth_type: AuthType,
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_password: Option<String>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub connect_on_startup: bool,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(default)]
    pub is_enabled: bool,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_socks_port() -> u16 {
    1080
}

fn default_true() -> bool {
    true
}

impl ServerRecord {
    /// Whether SOCKS5 clients connecting to this tunnel's listener must
    /// authenticate via RFC 1929 (both proxy credentials present).
    pub fn requires_proxy_auth(&self) -> bool {
        self.proxy_username.is_some() && self.proxy_password.is_some()
    }

    /// Identity used for import-deduplication: (host, username, sshPort).
    pub fn dedup_key(&self) -> (String, String, u16) {
        (self.host.clone(), self.username.clone(), self.ssh_port)
    }
}

/// A saved shortcut that launches a server with an overridden SOCKS port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickProfile {
    pub id: String,
    pub server_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks_port_override: Option<u16>,
}

/// On-disk envelope persisted by the Config Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_config_version")]
    pub version: u32,
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
    #[serde(default)]
    pub profiles: Vec<QuickProfile>,
    /// serverIds whose local SOCKS listener this application instance owns
    /// across process restarts — the "owned-tunnels set" of spec.md §4.6.2.
    #[serde(default)]
    pub owned_tunnels: Vec<String>,
    #[serde(default)]
    pub api_auth_enabled: bool,
    /// Bearer token for the Control API, hex-encoded random bytes
    /// (spec.md §4.12). Regenerable; `None` until first generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

fn default_config_version() -> u32 {
    CONFIG_VERSION
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            servers: Vec::new(),
            profiles: Vec::new(),
            owned_tunnels: Vec::new(),
            api_auth_enabled: true,
            api_token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_key() {
        let record = ServerRecord {
            id: "1".into(),
            name: "S".into(),
            host: "example.com".into(),
            ssh_port: 22,
            username: "u".into(),
            auth_type: AuthType::Password,
            socks_port: 1080,
            key_path: None,
            proxy_username: None,
            proxy_password: None,
            auto_reconnect: true,
            connect_on_startup: false,
            notifications_enabled: true,
            is_enabled: false,
        };
        assert_eq!(record.dedup_key(), ("example.com".into(), "u".into(), 22));
        assert!(!record.requires_proxy_auth());
    }

    #[test]
    fn server_record_wire_keys_are_camel_case() {
        let record = ServerRecord {
            id: "1".into(),
            name: "S".into(),
            host: "example.com".into(),
            ssh_port: 2222,
            username: "u".into(),
            auth_type: AuthType::Key,
            socks_port: 1080,
            key_path: None,
            proxy_username: None,
            proxy_password: None,
            auto_reconnect: true,
            connect_on_startup: false,
            notifications_enabled: true,
            is_enabled: true,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"sshPort\":2222"));
        assert!(json.contains("\"socksPort\":1080"));
        assert!(json.contains("\"authType\":\"key\""));
        assert!(json.contains("\"isEnabled\":true"));
        assert!(!json.contains("ssh_port"));

        let round_tripped: ServerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(round_tripped.ssh_port, 2222);
    }
}
