//! AEAD primitives backing the Secret Store's (C1) encrypted-file fallback.
//!
//! Used when the platform keychain is unavailable (headless hosts,
//! containers without a Secret Service). ChaCha20Poly1305 with an
//! Argon2id-derived key.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed")]
    Kdf,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,
}

/// Derive a 256-bit key from a high-entropy local secret using Argon2id.
///
/// 256MB memory cost / 4 iterations / parallelism 4 (~1-2s on a modern
/// CPU). The input here is not a human passphrase but a random machine-local
/// key file.
pub fn derive_key(secret: &[u8], salt: &[u8; SALT_LEN]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let params = Params::new(262_144, 4, 4, Some(32)).map_err(|_| CryptoError::Kdf)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(secret, salt, &mut *key)
        .map_err(|_| CryptoError::Kdf)?;
    Ok(key)
}

/// Encrypt `plaintext` under a key derived from `secret`.
/// Returns (salt, nonce, ciphertext||tag).
pub fn seal(secret: &[u8], plaintext: &[u8]) -> Result<([u8; SALT_LEN], [u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let key = derive_key(secret, &salt)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&*key).map_err(|_| CryptoError::Kdf)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok((salt, nonce, ciphertext))
}

/// Decrypt data produced by [`seal`].
pub fn open(
    secret: &[u8],
    salt: &[u8; SALT_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let key = derive_key(secret, salt)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&*key).map_err(|_| CryptoError::Kdf)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_deterministic() {
        let secret = b"machine-local-secret-material";
        let salt = [7u8; SALT_LEN];
        let k1 = derive_key(secret, &salt).unwrap();
        let k2 = derive_key(secret, &salt).unwrap();
        assert_eq!(&*k1, &*k2);

        let mut other_salt = salt;
        other_salt[0] ^= 0xFF;
        let k3 = derive_key(secret, &other_salt).unwrap();
        assert_ne!(&*k1, &*k3);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let secret = b"machine-local-secret-material";
        let plaintext = b"hunter2";
        let (salt, nonce, ciphertext) = seal(secret, plaintext).unwrap();
        let decrypted = open(secret, &salt, &nonce, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let (salt, nonce, ciphertext) = seal(b"right-secret", b"payload").unwrap();
        let result = open(b"wrong-secret", &salt, &nonce, &ciphertext);
        assert!(result.is_err());
    }

    #[test]
    fn test_tamper_detection() {
        let (salt, nonce, mut ciphertext) = seal(b"secret", b"payload").unwrap();
        ciphertext[0] ^= 0xFF;
        assert!(open(b"secret", &salt, &nonce, &ciphertext).is_err());
    }
}
