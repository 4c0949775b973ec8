//! SSH client dial + authenticate, using `russh`.
//!
//! `SshClient::connect` performs the DIALING and AUTHENTICATING phases of the
//! Tunnel Worker state machine (spec.md §4.6) and hands back a bare
//! `Handle<ClientHandler>`. The caller (the Worker) is expected to pass that
//! handle straight to `handle_owner::spawn_handle_owner_task`, which becomes
//! its sole owner for the rest of the tunnel's life.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::Channel;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::known_hosts::{get_known_hosts, HostKeyVerification};

/// Dials and authenticates one SSH server per a `SshConfig`.
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect to the SSH server and authenticate.
    ///
    /// Covers DIALING (TCP connect + SSH handshake) and AUTHENTICATING
    /// (password or publickey) from spec.md §4.6. Returns the raw `Handle`
    /// for the caller to hand to the handle-owner task.
    pub async fn connect(self) -> Result<Handle<ClientHandler>, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        // spec.md §4.6: 15s keepalive interval on the SSH session itself,
        // independent of the Health Monitor's own 30s measurement cadence.
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::with_trust(
            self.config.host.clone(),
            self.config.port,
            self.config.strict_host_key_checking,
            self.config.trust_host_key,
        );

        let mut handle = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))?
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed");

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                // spec.md §4.6.1: read keyPath from disk, decrypt with
                // keyPassphrase if present; any failure here (missing file,
                // wrong passphrase, unparseable key) is a "no_key" failure,
                // not a server-side auth rejection.
                let key = super::keys::load_private_key_async(
                    std::path::Path::new(key_path),
                    passphrase.as_deref(),
                )
                .await
                .map_err(|e| SshError::KeyError(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}", addr);

        Ok(handle)
    }
}

/// Client handler for russh callbacks.
///
/// Verifies host keys against `~/.ssh/known_hosts` (TOFU). Remote-initiated
/// channels (forwarded-tcpip, agent forwarding) are out of scope for this
/// daemon — only direct-tcpip channels opened by us are used — so no
/// `server_channel_open_forwarded_tcpip` override is needed; the default
/// `client::Handler` implementation rejects them.
pub struct ClientHandler {
    host: String,
    port: u16,
    /// - true: reject unknown/changed keys
    /// - false: auto-accept unknown keys (still reject changed)
    strict: bool,
    /// - None: use `strict` behavior
    /// - Some(true): trust and save unknown keys
    /// - Some(false): trust for session only (don't save)
    trust_host_key: Option<bool>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, strict: bool) -> Self {
        Self {
            host,
            port,
            strict,
            trust_host_key: None,
        }
    }

    pub fn with_trust(host: String, port: u16, strict: bool, trust_host_key: Option<bool>) -> Self {
        Self {
            host,
            port,
            strict,
            trust_host_key,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let known_hosts = get_known_hosts();
        let verification = known_hosts.verify(&self.host, self.port, server_public_key);

        match verification {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => {
                if let Some(trust) = self.trust_host_key {
                    if trust {
                        info!(
                            "TOFU: trusting and saving host key for {}:{} (fingerprint: {})",
                            self.host, self.port, fingerprint
                        );
                        if let Err(e) = known_hosts.add_host(&self.host, self.port, server_public_key) {
                            warn!("Failed to save host key: {}", e);
                        }
                    } else {
                        info!(
                            "TOFU: trusting host key for session only {}:{} (fingerprint: {})",
                            self.host, self.port, fingerprint
                        );
                    }
                    return Ok(true);
                }

                if self.strict {
                    warn!(
                        "Unknown host key for {}:{} (fingerprint: {}), rejecting under strict mode",
                        self.host, self.port, fingerprint
                    );
                    Err(SshError::ConnectionFailed(format!(
                        "host key verification failed: unknown host {}:{} (fingerprint {})",
                        self.host, self.port, fingerprint
                    )))
                } else {
                    info!(
                        "New host {}:{}, auto-adding to known_hosts (fingerprint: {})",
                        self.host, self.port, fingerprint
                    );
                    if let Err(e) = known_hosts.add_host(&self.host, self.port, server_public_key) {
                        warn!("Failed to save host key: {}", e);
                    }
                    Ok(true)
                }
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! expected {}, got {}",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::ConnectionFailed(format!(
                    "host key verification failed: key for {}:{} has changed (expected {}, got {}); \
                     remove the stale entry from ~/.ssh/known_hosts if this is expected",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }
}

/// Opens a direct-tcpip channel on an already-authenticated handle.
///
/// Thin wrapper kept separate from [`super::handle_owner`] so the BINDING/
/// CONNECTED phases can be unit tested against a handle without spawning the
/// owner task.
pub async fn open_direct_tcpip(
    handle: &mut Handle<ClientHandler>,
    host: &str,
    port: u32,
    originator_host: &str,
    originator_port: u32,
) -> Result<Channel<client::Msg>, SshError> {
    handle
        .channel_open_direct_tcpip(host, port, originator_host, originator_port)
        .await
        .map_err(|e| SshError::ChannelError(e.to_string()))
}
