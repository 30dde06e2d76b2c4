//! In-memory secret provider with AES-256-GCM encryption.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use async_trait::async_trait;
use cinder_core::ports::SecretProvider;
use cinder_core::secrets::SecretValue;
use cinder_core::{Error, Result};
use dashmap::DashMap;
use tracing::debug;

/// Holds secrets encrypted so plaintext never sits in the heap longer than
/// a lookup needs it.
pub struct NativeProvider {
    cipher: Aes256Gcm,
    secrets: DashMap<String, EncryptedSecret>,
}

struct EncryptedSecret {
    ciphertext: Vec<u8>,
    nonce: [u8; 12],
    version: u32,
}

impl NativeProvider {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&(*key).into()),
            secrets: DashMap::new(),
        }
    }

    /// A provider keyed with fresh random bytes, for process-lifetime use.
    pub fn ephemeral() -> Self {
        let key: [u8; 32] = rand::random();
        Self::new(&key)
    }

    /// Create from a master key string (hashed to 32 bytes).
    pub fn from_master_key(master_key: &str) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(master_key.as_bytes());
        let key: [u8; 32] = hasher.finalize().into();
        Self::new(&key)
    }

    /// Encrypt and store a secret, bumping its version.
    pub fn store(&self, name: &str, value: &str) -> Result<u32> {
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, value.as_bytes())
            .map_err(|e| Error::Internal(format!("secret encryption failed: {}", e)))?;

        let mut entry = self.secrets.entry(name.to_string()).or_insert(EncryptedSecret {
            ciphertext: Vec::new(),
            nonce: nonce_bytes,
            version: 0,
        });
        entry.ciphertext = ciphertext;
        entry.nonce = nonce_bytes;
        entry.version += 1;
        let version = entry.version;

        debug!(secret = %name, version, "secret stored");
        Ok(version)
    }

    pub fn delete(&self, name: &str) -> bool {
        self.secrets.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.secrets.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.secrets.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl SecretProvider for NativeProvider {
    fn name(&self) -> &str {
        "native"
    }

    async fn get(&self, name: &str) -> Result<Option<SecretValue>> {
        let Some(encrypted) = self.secrets.get(name) else {
            return Ok(None);
        };

        let nonce = Nonce::from_slice(&encrypted.nonce);
        let plaintext = self
            .cipher
            .decrypt(nonce, encrypted.ciphertext.as_ref())
            .map_err(|e| Error::Internal(format!("secret decryption failed: {}", e)))?;
        let value = String::from_utf8(plaintext)
            .map_err(|e| Error::Internal(format!("secret is not UTF-8: {}", e)))?;

        Ok(Some(
            SecretValue::new(value).with_version(encrypted.version.to_string()),
        ))
    }
}
