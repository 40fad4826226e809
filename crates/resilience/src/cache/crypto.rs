//! AES-256-GCM encryption for sensitive cache entries.
//!
//! Sensitive payloads are encrypted at rest inside the cache map so that a
//! memory dump or serialized snapshot never exposes patient-identifying
//! fields in the clear. Each payload gets a fresh random 96-bit nonce.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{ResilienceError, ResilienceResult};

/// Encrypted payload container stored in place of the plaintext bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EncryptedData {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// AES-256-GCM cipher bound to one cache instance.
pub(crate) struct CacheCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CacheCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCipher").field("key", &"[REDACTED]").finish()
    }
}

impl CacheCipher {
    /// Create a cipher from a raw 32-byte key.
    pub(crate) fn new(key: &[u8]) -> ResilienceResult<Self> {
        if key.len() != 32 {
            return Err(ResilienceError::cache("encryption key must be exactly 32 bytes"));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| ResilienceError::cache(format!("failed to create cipher: {e}")))?;

        Ok(Self { cipher })
    }

    /// Generate a random 32-byte symmetric key.
    pub(crate) fn generate_key() -> Vec<u8> {
        let mut key = vec![0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Encrypt bytes into an [`EncryptedData`] payload.
    pub(crate) fn encrypt(&self, data: &[u8]) -> ResilienceResult<EncryptedData> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(&Nonce::from(nonce_bytes), data)
            .map_err(|e| ResilienceError::cache(format!("encryption failed: {e}")))?;

        Ok(EncryptedData { nonce: nonce_bytes.to_vec(), ciphertext })
    }

    /// Decrypt an [`EncryptedData`] payload back into raw bytes.
    pub(crate) fn decrypt(&self, encrypted: &EncryptedData) -> ResilienceResult<Vec<u8>> {
        let nonce_array: [u8; 12] = encrypted
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| ResilienceError::cache("nonce must be exactly 12 bytes"))?;

        self.cipher
            .decrypt(&Nonce::from(nonce_array), encrypted.ciphertext.as_ref())
            .map_err(|e| ResilienceError::cache(format!("decryption failed: {e}")))
    }
}
