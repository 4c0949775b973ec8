//! Secret Store (C1) — keyed blob read/write/delete with at-rest encryption.
//!
//! Prefers the OS keychain (`keychain::Keychain`); when the platform has no
//! reachable keychain backend, falls back to an encrypted flat file guarded
//! by `crypto::seal`/`crypto::open`. The choice between backends is made
//! once, at construction, by probing the keychain — matching the "host
//! provided key management" language of the spec, which treats the backend
//! as a single pluggable collaborator rather than something that flips
//! mid-run.
//!
//! Guarantees: writes are durable (fsync'd, for the file backend) before
//! `put` returns. Failure modes: if the backend is unavailable, `get`
//! returns `None` and callers proceed with empty credentials; this is
//! logged as a warning and never panics or propagates as a hard error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::crypto::{self, NONCE_LEN, SALT_LEN};
use super::keychain::Keychain;

enum Backend {
    Keychain(Keychain),
    Vault,
}

/// On-disk shape of the fallback vault file.
#[derive(Serialize, Deserialize, Default)]
struct VaultFile {
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

pub struct SecretStore {
    backend: Backend,
    vault_path: PathBuf,
    vault_key_path: PathBuf,
}

impl SecretStore {
    /// Construct a Secret Store rooted at `config_dir`, probing the
    /// platform keychain once to decide which backend to use.
    pub fn new(config_dir: &Path) -> Self {
        let keychain = Keychain::new();
        let backend = if keychain.probe() {
            debug!("secret store: using OS keychain backend");
            Backend::Keychain(keychain)
        } else {
            warn!("secret store: OS keychain unavailable, falling back to encrypted vault file");
            Backend::Vault
        };

        Self {
            backend,
            vault_path: config_dir.join("secrets.vault"),
            vault_key_path: config_dir.join("secrets.key"),
        }
    }

    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), String> {
        match &self.backend {
            Backend::Keychain(kc) => {
                kc.store(key, bytes).map_err(|e| e.to_string())?;
                Ok(())
            }
            Backend::Vault => self.vault_put(key, bytes).await,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let result = match &self.backend {
            Backend::Keychain(kc) => kc.get(key).map_err(|e| e.to_string()),
            Backend::Vault => self.vault_get(key).await,
        };

        match result {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("secret store: get({}) failed, proceeding with empty credentials: {}", key, e);
                None
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), String> {
        match &self.backend {
            Backend::Keychain(kc) => kc.delete(key).map_err(|e| e.to_string()),
            Backend::Vault => self.vault_delete(key).await,
        }
    }

    // --- vault fallback -----------------------------------------------

    async fn vault_machine_key(&self) -> Result<Vec<u8>, String> {
        if let Ok(existing) = fs::read(&self.vault_key_path).await {
            if existing.len() == 32 {
                return Ok(existing);
            }
        }

        use rand::RngCore;
        let mut key = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);

        if let Some(parent) = self.vault_key_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
        }
        fs::write(&self.vault_key_path, &key).await.map_err(|e| e.to_string())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&self.vault_key_path, perms);
        }

        Ok(key)
    }

    async fn load_vault(&self, machine_key: &[u8]) -> HashMap<String, Vec<u8>> {
        let Ok(contents) = fs::read(&self.vault_path).await else {
            return HashMap::new();
        };
        let Ok(file) = rmp_serde::from_slice::<VaultFile>(&contents) else {
            warn!("secret store: vault file corrupted, starting empty");
            return HashMap::new();
        };
        match crypto::open(machine_key, &file.salt, &file.nonce, &file.ciphertext) {
            Ok(plaintext) => rmp_serde::from_slice(&plaintext).unwrap_or_default(),
            Err(e) => {
                warn!("secret store: vault decryption failed: {}", e);
                HashMap::new()
            }
        }
    }

    async fn save_vault(&self, machine_key: &[u8], entries: &HashMap<String, Vec<u8>>) -> Result<(), String> {
        let plaintext = rmp_serde::to_vec_named(entries).map_err(|e| e.to_string())?;
        let (salt, nonce, ciphertext) =
            crypto::seal(machine_key, &plaintext).map_err(|e| e.to_string())?;
        let file = VaultFile { salt, nonce, ciphertext };
        let bytes = rmp_serde::to_vec_named(&file).map_err(|e| e.to_string())?;

        if let Some(parent) = self.vault_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
        }
        let tmp_path = self.vault_path.with_extension("vault.tmp");
        let mut tmp = fs::File::create(&tmp_path).await.map_err(|e| e.to_string())?;
        tmp.write_all(&bytes).await.map_err(|e| e.to_string())?;
        tmp.sync_all().await.map_err(|e| e.to_string())?;
        fs::rename(&tmp_path, &self.vault_path).await.map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn vault_put(&self, key: &str, bytes: &[u8]) -> Result<(), String> {
        let machine_key = self.vault_machine_key().await?;
        let mut entries = self.load_vault(&machine_key).await;
        entries.insert(key.to_string(), bytes.to_vec());
        self.save_vault(&machine_key, &entries).await
    }

    async fn vault_get(&self, key: &str) -> Result<Vec<u8>, String> {
        let machine_key = self.vault_machine_key().await?;
        let entries = self.load_vault(&machine_key).await;
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| format!("no secret for key {}", key))
    }

    async fn vault_delete(&self, key: &str) -> Result<(), String> {
        let machine_key = self.vault_machine_key().await?;
        let mut entries = self.load_vault(&machine_key).await;
        entries.remove(key);
        self.save_vault(&machine_key, &entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn vault_store(dir: &Path) -> SecretStore {
        SecretStore {
            backend: Backend::Vault,
            vault_path: dir.join("secrets.vault"),
            vault_key_path: dir.join("secrets.key"),
        }
    }

    #[tokio::test]
    async fn test_vault_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = vault_store(dir.path());

        store.put("password_abc", b"hunter2").await.unwrap();
        assert_eq!(store.get("password_abc").await, Some(b"hunter2".to_vec()));

        store.delete("password_abc").await.unwrap();
        assert_eq!(store.get("password_abc").await, None);
    }

    #[tokio::test]
    async fn test_vault_missing_key_returns_none() {
        let dir = tempdir().unwrap();
        let store = vault_store(dir.path());
        assert_eq!(store.get("nonexistent").await, None);
    }

    #[tokio::test]
    async fn test_vault_persists_across_instances() {
        let dir = tempdir().unwrap();
        {
            let store = vault_store(dir.path());
            store.put("k", b"v").await.unwrap();
        }
        let store2 = vault_store(dir.path());
        assert_eq!(store2.get("k").await, Some(b"v".to_vec()));
    }
}
