// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory store with conditional-update semantics.
//!
//! Every mutation takes the write lock, checks its condition, and applies the
//! change while still holding the lock, which gives the same effect as a
//! single-statement conditional `UPDATE`.

use crate::{
    ApprovalStore, CounterStore, ManifestStore, RecordFilter, RecordStore, SecretStore, StoreError,
};
use apg_core::{Approval, ApprovalStatus, InteractionRecord, Manifest, ManifestStatus};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    manifests: HashMap<(String, String), Vec<Manifest>>,
    approvals: HashMap<Uuid, Approval>,
    counters: HashMap<(String, String, NaiveDate), u64>,
    records: HashMap<(String, String), Vec<InteractionRecord>>,
    secrets: HashMap<(String, String), Vec<u8>>,
}

/// In-memory [`crate::Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManifestStore for MemoryStore {
    async fn put_manifest(&self, manifest: Manifest) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = (manifest.org_id.clone(), manifest.uapk_id.clone());
        let versions = inner.manifests.entry(key).or_default();
        versions.retain(|m| m.version != manifest.version);
        versions.push(manifest);
        versions.sort_by_key(|m| m.version);
        Ok(())
    }

    async fn activate_manifest(
        &self,
        org_id: &str,
        uapk_id: &str,
        version: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = (org_id.to_string(), uapk_id.to_string());
        let versions = inner.manifests.get_mut(&key).ok_or(StoreError::NotFound)?;
        if !versions.iter().any(|m| m.version == version) {
            return Err(StoreError::NotFound);
        }
        // Demote-and-promote under one lock: the chain of states other
        // readers can observe never contains two ACTIVE rows.
        for m in versions.iter_mut() {
            if m.status == ManifestStatus::Active {
                m.status = ManifestStatus::Inactive;
            }
        }
        for m in versions.iter_mut() {
            if m.version == version {
                m.status = ManifestStatus::Active;
            }
        }
        debug!(org_id, uapk_id, version, "manifest activated");
        Ok(())
    }

    async fn get_active_manifest(
        &self,
        org_id: &str,
        uapk_id: &str,
    ) -> Result<Option<Manifest>, StoreError> {
        let inner = self.inner.read().await;
        let key = (org_id.to_string(), uapk_id.to_string());
        Ok(inner
            .manifests
            .get(&key)
            .and_then(|versions| {
                versions
                    .iter()
                    .find(|m| m.status == ManifestStatus::Active)
            })
            .cloned())
    }
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn insert_approval(&self, approval: Approval) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.approvals.insert(approval.approval_id, approval);
        Ok(())
    }

    async fn get_approval(
        &self,
        org_id: &str,
        approval_id: Uuid,
    ) -> Result<Option<Approval>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .approvals
            .get(&approval_id)
            .filter(|a| a.org_id == org_id)
            .cloned())
    }

    async fn find_approval(&self, approval_id: Uuid) -> Result<Option<Approval>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.approvals.get(&approval_id).cloned())
    }

    async fn find_reusable_pending(
        &self,
        org_id: &str,
        uapk_id: &str,
        agent_id: &str,
        action_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Approval>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .approvals
            .values()
            .filter(|a| {
                a.org_id == org_id
                    && a.uapk_id == uapk_id
                    && a.agent_id == agent_id
                    && a.action_hash == action_hash
                    && a.status == ApprovalStatus::Pending
                    && a.expires_at > now
            })
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn list_approvals(
        &self,
        org_id: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<Approval>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Approval> = inner
            .approvals
            .values()
            .filter(|a| a.org_id == org_id && status.is_none_or(|s| a.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn decide_approval(
        &self,
        org_id: &str,
        approval_id: Uuid,
        status: ApprovalStatus,
        decided_by: &str,
        decided_at: DateTime<Utc>,
        override_token_hash: Option<String>,
    ) -> Result<Approval, StoreError> {
        let mut inner = self.inner.write().await;
        let approval = inner
            .approvals
            .get_mut(&approval_id)
            .filter(|a| a.org_id == org_id)
            .ok_or(StoreError::NotFound)?;
        if approval.status != ApprovalStatus::Pending {
            return Err(StoreError::Conflict(format!(
                "approval is {:?}, not PENDING",
                approval.status
            )));
        }
        approval.status = status;
        approval.decided_at = Some(decided_at);
        approval.decided_by = Some(decided_by.to_string());
        approval.override_token_hash = override_token_hash;
        Ok(approval.clone())
    }

    async fn consume_approval(
        &self,
        approval_id: Uuid,
        interaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(approval) = inner.approvals.get_mut(&approval_id) else {
            return Ok(false);
        };
        if approval.status != ApprovalStatus::Approved
            || approval.consumed_at.is_some()
            || approval.expires_at <= now
        {
            return Ok(false);
        }
        approval.consumed_at = Some(now);
        approval.consumed_interaction_id = Some(interaction_id);
        Ok(true)
    }

    async fn expire_stale_approvals(
        &self,
        org_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let mut reaped = 0;
        for approval in inner.approvals.values_mut() {
            if approval.org_id == org_id
                && approval.status == ApprovalStatus::Pending
                && approval.expires_at <= now
            {
                approval.status = ApprovalStatus::Expired;
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn reserve_slot(
        &self,
        org_id: &str,
        uapk_id: &str,
        date: NaiveDate,
        cap: u64,
    ) -> Result<Option<u64>, StoreError> {
        let mut inner = self.inner.write().await;
        let key = (org_id.to_string(), uapk_id.to_string(), date);
        let count = inner.counters.entry(key).or_insert(0);
        if *count >= cap {
            return Ok(None);
        }
        *count += 1;
        Ok(Some(*count))
    }

    async fn release_slot(
        &self,
        org_id: &str,
        uapk_id: &str,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let key = (org_id.to_string(), uapk_id.to_string(), date);
        match inner.counters.get_mut(&key) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn counter_value(
        &self,
        org_id: &str,
        uapk_id: &str,
        date: NaiveDate,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        let key = (org_id.to_string(), uapk_id.to_string(), date);
        Ok(inner.counters.get(&key).copied().unwrap_or(0))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn append_record(&self, record: InteractionRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = (record.org_id.clone(), record.uapk_id.clone());
        let chain = inner.records.entry(key).or_default();
        let expected_previous = chain
            .last()
            .map_or(apg_core::GENESIS_HASH, |r| r.record_hash.as_str());
        if record.previous_record_hash != expected_previous {
            return Err(StoreError::Conflict(format!(
                "previous hash {} does not match chain tip {expected_previous}",
                record.previous_record_hash
            )));
        }
        chain.push(record);
        Ok(())
    }

    async fn last_record_hash(
        &self,
        org_id: &str,
        uapk_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read().await;
        let key = (org_id.to_string(), uapk_id.to_string());
        Ok(inner
            .records
            .get(&key)
            .and_then(|chain| chain.last())
            .map(|r| r.record_hash.clone()))
    }

    async fn chain_records(
        &self,
        org_id: &str,
        uapk_id: &str,
    ) -> Result<Vec<InteractionRecord>, StoreError> {
        let inner = self.inner.read().await;
        let key = (org_id.to_string(), uapk_id.to_string());
        Ok(inner.records.get(&key).cloned().unwrap_or_default())
    }

    async fn list_records(
        &self,
        org_id: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<InteractionRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<InteractionRecord> = inner
            .records
            .iter()
            .filter(|((org, uapk), _)| {
                org == org_id && filter.uapk_id.as_ref().is_none_or(|want| want == uapk)
            })
            .flat_map(|(_, chain)| chain.iter().cloned())
            .filter(|r| {
                filter.from.is_none_or(|from| r.created_at >= from)
                    && filter.to.is_none_or(|to| r.created_at < to)
            })
            .collect();
        out.sort_by_key(|r| r.created_at);
        let offset = filter.offset.unwrap_or(0);
        let out: Vec<InteractionRecord> = out.into_iter().skip(offset).collect();
        if let Some(limit) = filter.limit {
            return Ok(out.into_iter().take(limit).collect());
        }
        Ok(out)
    }

    async fn chain_keys(&self, org_id: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut keys: Vec<String> = inner
            .records
            .keys()
            .filter(|(org, _)| org == org_id)
            .map(|(_, uapk)| uapk.clone())
            .collect();
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn put_secret(
        &self,
        org_id: &str,
        key: &str,
        ciphertext: Vec<u8>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .secrets
            .insert((org_id.to_string(), key.to_string()), ciphertext);
        Ok(())
    }

    async fn get_secret(&self, org_id: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .secrets
            .get(&(org_id.to_string(), key.to_string()))
            .cloned())
    }
}
