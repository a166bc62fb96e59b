// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! apg-store
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod memory;

pub use memory::MemoryStore;

use apg_core::{Approval, ApprovalStatus, InteractionRecord, Manifest};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Errors from store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("not found")]
    NotFound,
    /// A conditional update matched zero rows.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Backend failure.
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Filter for interaction-record listings.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Restrict to one manifest family.
    pub uapk_id: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub to: Option<DateTime<Utc>>,
    /// Maximum rows returned.
    pub limit: Option<usize>,
    /// Rows skipped before the first returned.
    pub offset: Option<usize>,
}

/// Manifest persistence. Writes come from the admin collaborator; the
/// gateway only reads, with the exception of `activate` used by tests and
/// fixtures.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Insert or replace a manifest version.
    async fn put_manifest(&self, manifest: Manifest) -> Result<(), StoreError>;

    /// Promote `version` to ACTIVE and demote any currently ACTIVE manifest
    /// of the same `(org, uapk)` to INACTIVE, as one atomic transition.
    async fn activate_manifest(
        &self,
        org_id: &str,
        uapk_id: &str,
        version: u32,
    ) -> Result<(), StoreError>;

    /// The single ACTIVE manifest for `(org, uapk)`, if one exists.
    /// PENDING rows are invisible here by construction.
    async fn get_active_manifest(
        &self,
        org_id: &str,
        uapk_id: &str,
    ) -> Result<Option<Manifest>, StoreError>;
}

/// Approval persistence with atomic consumption.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Insert a new approval row.
    async fn insert_approval(&self, approval: Approval) -> Result<(), StoreError>;

    /// Fetch by id, scoped to an organisation.
    async fn get_approval(
        &self,
        org_id: &str,
        approval_id: Uuid,
    ) -> Result<Option<Approval>, StoreError>;

    /// Fetch by id without org scoping (policy-engine internal lookup).
    async fn find_approval(&self, approval_id: Uuid) -> Result<Option<Approval>, StoreError>;

    /// An unexpired PENDING approval for the same `(org, uapk, agent,
    /// action_hash)`, used to avoid stacking duplicate escalations.
    async fn find_reusable_pending(
        &self,
        org_id: &str,
        uapk_id: &str,
        agent_id: &str,
        action_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Approval>, StoreError>;

    /// List approvals for an organisation, optionally filtered by status,
    /// newest first.
    async fn list_approvals(
        &self,
        org_id: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<Approval>, StoreError>;

    /// Conditional `PENDING → status` transition stamping the decision
    /// fields. Returns the updated row, or [`StoreError::Conflict`] if the
    /// approval was not PENDING.
    async fn decide_approval(
        &self,
        org_id: &str,
        approval_id: Uuid,
        status: ApprovalStatus,
        decided_by: &str,
        decided_at: DateTime<Utc>,
        override_token_hash: Option<String>,
    ) -> Result<Approval, StoreError>;

    /// The one-time consumption guard: set `consumed_at` and
    /// `consumed_interaction_id` iff `status = APPROVED AND consumed_at IS
    /// NULL AND expires_at > now`. Returns `true` iff exactly one row
    /// changed. This single conditional update is the sole replay defence.
    async fn consume_approval(
        &self,
        approval_id: Uuid,
        interaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Lazily mark expired PENDING approvals as EXPIRED. Returns the number
    /// of rows reaped.
    async fn expire_stale_approvals(
        &self,
        org_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// Daily action counters with atomic reserve/release.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Claim one slot under `cap` for the day: `count = count + 1 WHERE
    /// count < cap` with upsert of a missing row. Returns the new count, or
    /// `None` when the cap is already reached.
    async fn reserve_slot(
        &self,
        org_id: &str,
        uapk_id: &str,
        date: NaiveDate,
        cap: u64,
    ) -> Result<Option<u64>, StoreError>;

    /// Undo a reservation: `count = count - 1 WHERE count > 0`. Returns
    /// whether a row changed.
    async fn release_slot(
        &self,
        org_id: &str,
        uapk_id: &str,
        date: NaiveDate,
    ) -> Result<bool, StoreError>;

    /// Current count for the day (0 when the row is missing).
    async fn counter_value(
        &self,
        org_id: &str,
        uapk_id: &str,
        date: NaiveDate,
    ) -> Result<u64, StoreError>;
}

/// Append-only interaction record storage.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Append a record. Fails with [`StoreError::Conflict`] when
    /// `previous_record_hash` does not match the current chain tip; the
    /// audit lock makes that unreachable in normal operation.
    async fn append_record(&self, record: InteractionRecord) -> Result<(), StoreError>;

    /// Hash of the latest record on the `(org, uapk)` chain.
    async fn last_record_hash(
        &self,
        org_id: &str,
        uapk_id: &str,
    ) -> Result<Option<String>, StoreError>;

    /// All records of one chain in insertion order.
    async fn chain_records(
        &self,
        org_id: &str,
        uapk_id: &str,
    ) -> Result<Vec<InteractionRecord>, StoreError>;

    /// Records across an organisation's chains, filtered and ordered by
    /// `created_at`.
    async fn list_records(
        &self,
        org_id: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<InteractionRecord>, StoreError>;

    /// The uapk ids that have at least one record for `org_id`.
    async fn chain_keys(&self, org_id: &str) -> Result<Vec<String>, StoreError>;
}

/// Encrypted secret storage. Values are AEAD ciphertexts; the vault owns
/// the key.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Insert or replace a ciphertext.
    async fn put_secret(&self, org_id: &str, key: &str, ciphertext: Vec<u8>)
    -> Result<(), StoreError>;

    /// Fetch a ciphertext.
    async fn get_secret(&self, org_id: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Everything the gateway needs from persistence, in one object-safe bundle.
pub trait Store:
    ManifestStore + ApprovalStore + CounterStore + RecordStore + SecretStore
{
}

impl<T: ManifestStore + ApprovalStore + CounterStore + RecordStore + SecretStore> Store for T {}

/// Shared handle to a store implementation.
pub type SharedStore = Arc<dyn Store>;
