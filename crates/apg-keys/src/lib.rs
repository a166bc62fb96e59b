// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! apg-keys
#![deny(unsafe_code)]
#![warn(missing_docs)]

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use pkcs8::LineEnding;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::path::Path;
use tracing::warn;

/// Errors from key loading or persistence.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// The supplied material is neither PKCS#8 PEM nor a 32-byte base64 seed.
    #[error("unrecognised key material: {0}")]
    InvalidMaterial(String),

    /// Filesystem failure while persisting or reading a generated key.
    #[error("key file i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-wide Ed25519 signer.
///
/// Constructed once at startup and shared by reference. Signs audit-record
/// hashes and capability/override tokens; the private half never leaves the
/// process.
#[derive(Debug, Clone)]
pub struct KeyManager {
    signing: SigningKey,
    key_id: Option<String>,
}

impl KeyManager {
    /// Load a key from configured material: PKCS#8 PEM, or a base64-encoded
    /// 32-byte seed (standard or url-safe alphabet).
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidMaterial`] when nothing parses.
    pub fn from_material(material: &str) -> Result<Self, KeyError> {
        let trimmed = material.trim();
        if trimmed.contains("BEGIN") {
            let signing = SigningKey::from_pkcs8_pem(trimmed)
                .map_err(|e| KeyError::InvalidMaterial(format!("pem: {e}")))?;
            return Ok(Self {
                signing,
                key_id: None,
            });
        }
        let decoded = STANDARD
            .decode(trimmed)
            .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
            .map_err(|e| KeyError::InvalidMaterial(format!("base64: {e}")))?;
        let seed: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidMaterial(format!("seed is {} bytes, want 32", decoded.len())))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
            key_id: None,
        })
    }

    /// Generate a fresh keypair.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing: SigningKey::generate(&mut rng),
            key_id: None,
        }
    }

    /// Load from `material` when present, otherwise generate a development
    /// keypair, warn, and persist it to `persist_path` so later runs reuse it.
    ///
    /// Production environments must not reach the generate branch; the config
    /// layer refuses to start without configured material there.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] on unparseable material or persistence failure.
    pub fn bootstrap(material: Option<&str>, persist_path: Option<&Path>) -> Result<Self, KeyError> {
        if let Some(material) = material {
            return Self::from_material(material);
        }
        if let Some(path) = persist_path {
            if path.exists() {
                let pem = std::fs::read_to_string(path)?;
                return Self::from_material(&pem);
            }
            let manager = Self::generate();
            warn!(
                path = %path.display(),
                "no signing key configured; generated a development keypair"
            );
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let pem = manager
                .signing
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| KeyError::InvalidMaterial(format!("pkcs8 encode: {e}")))?;
            std::fs::write(path, pem.as_bytes())?;
            return Ok(manager);
        }
        warn!("no signing key configured; generated an ephemeral development keypair");
        Ok(Self::generate())
    }

    /// Attach a key identifier carried into signed records.
    #[must_use]
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    /// Key identifier, when configured.
    #[must_use]
    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    /// Sign a message.
    #[must_use]
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing.sign(msg)
    }

    /// Sign a message and return the signature base64 encoded.
    #[must_use]
    pub fn sign_b64(&self, msg: &[u8]) -> String {
        STANDARD.encode(self.sign(msg).to_bytes())
    }

    /// Verify a signature against this manager's public key.
    #[must_use]
    pub fn verify(&self, msg: &[u8], sig: &Signature) -> bool {
        self.signing.verifying_key().verify(msg, sig).is_ok()
    }

    /// Verify a raw 64-byte signature against this manager's public key.
    #[must_use]
    pub fn verify_bytes(&self, msg: &[u8], sig: &[u8; 64]) -> bool {
        self.verify(msg, &Signature::from_bytes(sig))
    }

    /// Verify a base64 signature against this manager's public key.
    #[must_use]
    pub fn verify_b64(&self, msg: &[u8], sig_b64: &str) -> bool {
        let Ok(bytes) = STANDARD.decode(sig_b64) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
            return false;
        };
        self.verify(msg, &Signature::from_bytes(&sig_bytes))
    }

    /// Raw public key bytes.
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Base64 public key for proofs and export bundles.
    #[must_use]
    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.public_key_bytes())
    }

    /// SPKI PEM public key, as shipped in audit export bundles.
    #[must_use]
    pub fn public_key_pem(&self) -> String {
        self.signing
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap_or_default()
    }
}

/// Verify a base64 signature under an externally supplied public key.
#[must_use]
pub fn verify_with_public_key(pk: &[u8; 32], msg: &[u8], sig_b64: &str) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(pk) else {
        return false;
    };
    let Ok(bytes) = STANDARD.decode(sig_b64) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
        return false;
    };
    key.verify(msg, &Signature::from_bytes(&sig_bytes)).is_ok()
}
