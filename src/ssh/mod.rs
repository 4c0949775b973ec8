//! SSH module — dial, authenticate, and own one `russh` client per Tunnel
//! Worker (spec.md §4.6).
//!
//! # Contents
//! - [`client`]: TCP dial + SSH handshake + auth (DIALING/AUTHENTICATING).
//! - [`handle_owner`]: single-owner task for the authenticated `Handle`,
//!   exposing a cloneable [`HandleController`] to the rest of the process.
//! - [`keys`]: private key loading for `authType = key`.
//! - [`known_hosts`]: TOFU host key verification against `~/.ssh/known_hosts`.
//! - [`config`]/[`error`]: shared config and error types.

mod client;
mod config;
mod error;
mod handle_owner;
mod keys;
pub mod known_hosts;

pub use client::{open_direct_tcpip, ClientHandler, SshClient};
pub use config::{AuthMethod, SshConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use keys::{load_private_key, load_private_key_async, KeyError};
pub use known_hosts::{get_known_hosts, HostKeyVerification, KnownHostsStore};
