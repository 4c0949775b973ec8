//! Loading and parsing SSH private keys for the `key` auth method
//! (spec.md §4.6.1): RSA, Ed25519, and ECDSA, with optional passphrase.

use russh::keys::PrivateKey as KeyPair;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during key loading
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read key file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse key: {0}")]
    ParseError(String),

    #[error("Encrypted key requires passphrase")]
    PassphraseRequired,

    #[error("Invalid passphrase")]
    InvalidPassphrase,
}

/// Load a private key from file (async version - preferred in async contexts)
pub async fn load_private_key_async(
    path: &Path,
    passphrase: Option<&str>,
) -> Result<KeyPair, KeyError> {
    let path = path.to_path_buf();
    let passphrase = passphrase.map(|s| s.to_string());

    tokio::task::spawn_blocking(move || load_private_key_sync(&path, passphrase.as_deref()))
        .await
        .map_err(|e| KeyError::ParseError(format!("Task join error: {}", e)))?
}

/// Load a private key from file (sync version - use spawn_blocking in async contexts)
pub fn load_private_key(path: &Path, passphrase: Option<&str>) -> Result<KeyPair, KeyError> {
    load_private_key_sync(path, passphrase)
}

/// Internal sync implementation. Resolves `~` before reading so API callers
/// can hand through a keyPath exactly as the user typed it.
fn load_private_key_sync(path: &Path, passphrase: Option<&str>) -> Result<KeyPair, KeyError> {
    let path = expand_tilde(path);
    if !path.exists() {
        return Err(KeyError::NotFound(path));
    }

    let key_data = std::fs::read_to_string(&path)?;

    let is_encrypted =
        key_data.contains("ENCRYPTED") || key_data.contains("Proc-Type: 4,ENCRYPTED");

    if is_encrypted && passphrase.is_none() {
        return Err(KeyError::PassphraseRequired);
    }

    match passphrase {
        Some(pass) => russh::keys::decode_secret_key(&key_data, Some(pass)).map_err(|e| {
            if e.to_string().contains("decrypt") || e.to_string().contains("password") {
                KeyError::InvalidPassphrase
            } else {
                KeyError::ParseError(e.to_string())
            }
        }),
        None => russh::keys::decode_secret_key(&key_data, None)
            .map_err(|e| KeyError::ParseError(e.to_string())),
    }
}

/// Expand a leading `~` to the current user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde(Path::new("~/.ssh/id_rsa"));
        assert!(!path.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn missing_key_file_is_not_found() {
        let err = load_private_key(Path::new("/nonexistent/path/id_rsa"), None).unwrap_err();
        assert!(matches!(err, KeyError::NotFound(_)));
    }
}
