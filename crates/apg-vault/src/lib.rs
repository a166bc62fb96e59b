// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! apg-vault
#![deny(unsafe_code)]
#![warn(missing_docs)]

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use apg_store::SecretStore;
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use rand::RngCore;
use std::collections::BTreeMap;
use std::sync::Arc;

const NONCE_LEN: usize = 12;

/// Errors from vault operations.
///
/// Messages are deliberately generic: no variant ever carries plaintext or
/// key material.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The configured key is missing, undecodable, or too short.
    #[error("vault key invalid: {0}")]
    KeyInvalid(String),
    /// No secret stored under the requested reference.
    #[error("secret not found")]
    NotFound,
    /// Decryption or encoding failure.
    #[error("vault crypto failure")]
    Crypto,
    /// Storage backend failure.
    #[error(transparent)]
    Store(#[from] apg_store::StoreError),
}

/// AEAD-encrypted secrets vault backed by a [`SecretStore`].
pub struct Vault {
    cipher: Aes256Gcm,
    store: Arc<dyn SecretStore>,
}

impl Vault {
    /// Build a vault from base64 key material (standard or url-safe
    /// alphabet). The decoded key must be at least 32 bytes; the first 32
    /// are used.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::KeyInvalid`] for undecodable or short material.
    pub fn new(key_material: &str, store: Arc<dyn SecretStore>) -> Result<Self, VaultError> {
        let decoded = STANDARD
            .decode(key_material.trim())
            .or_else(|_| URL_SAFE_NO_PAD.decode(key_material.trim()))
            .map_err(|e| VaultError::KeyInvalid(format!("base64: {e}")))?;
        if decoded.len() < 32 {
            return Err(VaultError::KeyInvalid(format!(
                "key is {} bytes, want at least 32",
                decoded.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(&decoded[..32]);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
            store,
        })
    }

    /// Encrypt and store a secret under `(org_id, key)`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Crypto`] on encryption failure or a store error.
    pub async fn put(&self, org_id: &str, key: &str, plaintext: &str) -> Result<(), VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Crypto)?;
        let mut stored = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        stored.extend_from_slice(&nonce_bytes);
        stored.extend_from_slice(&ciphertext);
        self.store.put_secret(org_id, key, stored).await?;
        Ok(())
    }

    /// Fetch and decrypt a secret.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] for missing keys and
    /// [`VaultError::Crypto`] when the ciphertext does not authenticate.
    pub async fn get(&self, org_id: &str, key: &str) -> Result<String, VaultError> {
        let stored = self
            .store
            .get_secret(org_id, key)
            .await?
            .ok_or(VaultError::NotFound)?;
        if stored.len() <= NONCE_LEN {
            return Err(VaultError::Crypto);
        }
        let (nonce_bytes, ciphertext) = stored.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::Crypto)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::Crypto)
    }

    /// Resolve a tool's secret references into a name → plaintext map for
    /// connector injection. Missing references fail the whole resolution.
    ///
    /// # Errors
    ///
    /// Propagates [`Vault::get`] failures.
    pub async fn resolve_refs(
        &self,
        org_id: &str,
        refs: &[String],
    ) -> Result<BTreeMap<String, String>, VaultError> {
        let mut out = BTreeMap::new();
        for key in refs {
            out.insert(key.clone(), self.get(org_id, key).await?);
        }
        Ok(out)
    }
}
