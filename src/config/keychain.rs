//! OS keychain integration for the Secret Store (C1).
//!
//! Securely stores password/private-key/passphrase blobs in the system
//! keychain via the cross-platform `keyring` crate. This is the preferred
//! backend; callers fall back to [`super::vault::SecretVault`] when the
//! platform has no keychain daemon available (headless Linux hosts,
//! containers without a Secret Service).

use keyring::Entry;

/// Service name for keychain entries.
const SERVICE_NAME: &str = "com.tunnelmgrd.secrets";

/// Keychain errors.
#[derive(Debug, thiserror::Error)]
pub enum KeychainError {
    #[error("keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("secret not found for key: {0}")]
    NotFound(String),
}

/// Keychain-backed secret storage.
pub struct Keychain {
    service: String,
}

impl Keychain {
    /// Create a new keychain manager using the default service name.
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Create with a custom service name (for testing).
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, KeychainError> {
        // Username-prefixed account name keeps the identity stable across
        // keychain backends that scope entries per-user.
        let username = whoami::username();
        Ok(Entry::new(&self.service, &format!("{}@{}", username, key))?)
    }

    /// Store a secret blob, base64-encoded since `keyring` stores strings.
    pub fn store(&self, key: &str, secret: &[u8]) -> Result<(), KeychainError> {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(secret);
        let entry = self.entry(key)?;
        entry.set_password(&encoded)?;
        Ok(())
    }

    /// Retrieve a secret blob.
    pub fn get(&self, key: &str) -> Result<Vec<u8>, KeychainError> {
        use base64::Engine;
        let entry = self.entry(key)?;
        match entry.get_password() {
            Ok(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|_| KeychainError::NotFound(key.to_string())),
            Err(keyring::Error::NoEntry) => Err(KeychainError::NotFound(key.to_string())),
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }

    /// Delete a secret. Treats an already-missing entry as success.
    pub fn delete(&self, key: &str) -> Result<(), KeychainError> {
        let entry = self.entry(key)?;
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }

    /// Probe whether the platform keychain backend is actually reachable.
    /// Stores and immediately deletes a throwaway entry.
    pub fn probe(&self) -> bool {
        let probe_key = "__tunnelmgrd_probe__";
        if self.store(probe_key, b"probe").is_err() {
            return false;
        }
        let _ = self.delete(probe_key);
        true
    }
}

impl Default for Keychain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // interacts with the real system keychain; run manually
    fn test_keychain_roundtrip() {
        let keychain = Keychain::with_service("com.tunnelmgrd.test");
        keychain.store("unit-test-key", b"test-secret").unwrap();
        assert_eq!(keychain.get("unit-test-key").unwrap(), b"test-secret");
        keychain.delete("unit-test-key").unwrap();
        assert!(matches!(
            keychain.get("unit-test-key"),
            Err(KeychainError::NotFound(_))
        ));
    }
}
