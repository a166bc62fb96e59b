// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! apg-manifest
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod normalise;

pub use normalise::normalise_policy;

use apg_core::{Manifest, PolicyConfig};
use apg_store::ManifestStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Errors from manifest resolution.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// No ACTIVE manifest exists for the requested pair.
    #[error("no active manifest for ({org_id}, {uapk_id})")]
    NotFound {
        /// Requested organisation.
        org_id: String,
        /// Requested manifest family.
        uapk_id: String,
    },
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] apg_store::StoreError),
}

/// A manifest ready for evaluation: normalised policy plus content hash.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    /// The manifest row as stored.
    pub manifest: Manifest,
    /// Policy in the one shape the engine consumes.
    pub policy: PolicyConfig,
    /// SHA-256 over the canonical manifest content; becomes
    /// `policy_version` in responses and records.
    pub content_hash: String,
}

struct CacheEntry {
    loaded_at: Instant,
    resolved: Arc<ResolvedManifest>,
}

/// Read-side manifest adapter with a short-TTL cache.
///
/// Only ACTIVE manifests are ever returned; a freshly uploaded PENDING
/// version never shadows the ACTIVE one.
pub struct ManifestResolver {
    store: Arc<dyn ManifestStore>,
    cache: RwLock<HashMap<(String, String), CacheEntry>>,
    ttl: Duration,
}

impl ManifestResolver {
    /// Default cache TTL.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

    /// Build a resolver over `store`.
    pub fn new(store: Arc<dyn ManifestStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolve the ACTIVE manifest for `(org_id, uapk_id)`.
    ///
    /// # Errors
    ///
    /// [`ManifestError::NotFound`] when no ACTIVE row exists.
    pub async fn get_active(
        &self,
        org_id: &str,
        uapk_id: &str,
    ) -> Result<Arc<ResolvedManifest>, ManifestError> {
        let key = (org_id.to_string(), uapk_id.to_string());
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&key) {
                if entry.loaded_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&entry.resolved));
                }
            }
        }

        let manifest = self
            .store
            .get_active_manifest(org_id, uapk_id)
            .await?
            .ok_or_else(|| ManifestError::NotFound {
                org_id: org_id.to_string(),
                uapk_id: uapk_id.to_string(),
            })?;

        let resolved = Arc::new(resolve(manifest));
        debug!(
            org_id,
            uapk_id,
            content_hash = %resolved.content_hash,
            "manifest resolved"
        );

        let mut cache = self.cache.write().await;
        cache.insert(
            key,
            CacheEntry {
                loaded_at: Instant::now(),
                resolved: Arc::clone(&resolved),
            },
        );
        Ok(resolved)
    }

    /// Drop every cached entry. Used after activations in tests and fixtures.
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }
}

/// Normalise and hash a manifest into its evaluation-ready form.
#[must_use]
pub fn resolve(mut manifest: Manifest) -> ResolvedManifest {
    let policy = normalise_policy(&manifest.content.policy);
    let content_value = serde_json::to_value(&manifest.content).unwrap_or_default();
    let content_hash = apg_canon::hash_value(&content_value)
        .map(|digest| apg_canon::to_hex(&digest))
        .unwrap_or_default();
    manifest.content_hash = Some(content_hash.clone());
    ResolvedManifest {
        manifest,
        policy,
        content_hash,
    }
}
