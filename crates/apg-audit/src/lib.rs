// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! apg-audit
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod export;
mod merkle;

pub use export::ExportBundle;
pub use merkle::merkle_root;

use apg_core::{
    Action, DecisionKind, ExecutionResult, GENESIS_HASH, InteractionRecord, Reason, TraceEntry,
};
use apg_keys::KeyManager;
use apg_store::{RecordFilter, RecordStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors from audit-chain operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The record could not be canonicalised.
    #[error(transparent)]
    Canon(#[from] apg_canon::CanonError),
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] apg_store::StoreError),
    /// Export serialization failure.
    #[error("export failed: {0}")]
    Export(String),
}

/// Everything an interaction record carries except the derived chain fields.
///
/// [`AuditChain::append`] turns a draft into a persisted
/// [`InteractionRecord`] by filling `previous_record_hash`, `record_hash`,
/// and `gateway_signature`.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    /// Record identifier (allocated by the gateway before the connector
    /// call so consumption can reference it).
    pub record_id: Uuid,
    /// Owning organisation.
    pub org_id: String,
    /// Manifest family.
    pub uapk_id: String,
    /// Agent that proposed the action.
    pub agent_id: String,
    /// The proposed action.
    pub action: Action,
    /// Action hash at request time.
    pub request_hash: String,
    /// Final decision.
    pub decision: DecisionKind,
    /// Accumulated reasons.
    pub reasons: Vec<Reason>,
    /// Ordered stage trace.
    pub policy_trace: Vec<TraceEntry>,
    /// Whether a connector ran.
    pub executed: bool,
    /// Connector outcome.
    pub result: Option<ExecutionResult>,
    /// Linked approval.
    pub approval_id: Option<Uuid>,
    /// Opaque caller context.
    pub context: Option<serde_json::Value>,
    /// Append timestamp.
    pub created_at: DateTime<Utc>,
}

/// A mismatch found during chain verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainMismatch {
    /// Index of the first bad record.
    pub index: usize,
    /// Hash the chain rules require at that index.
    pub expected: String,
    /// Hash actually stored.
    pub got: String,
}

/// Result of verifying one `(org, uapk)` chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainReport {
    /// Manifest family the chain belongs to.
    pub uapk_id: String,
    /// Whether every link and signature checked out.
    pub valid: bool,
    /// Number of records on the chain.
    pub record_count: usize,
    /// Number of records whose signature verified.
    pub signature_valid_count: usize,
    /// First mismatch, when invalid. Verification stops there.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mismatch: Option<ChainMismatch>,
}

/// Hash-chained, signed audit log over a [`RecordStore`].
pub struct AuditChain {
    records: Arc<dyn RecordStore>,
    keys: Arc<KeyManager>,
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl AuditChain {
    /// Build a chain over `records`, signing with `keys`.
    pub fn new(records: Arc<dyn RecordStore>, keys: Arc<KeyManager>) -> Self {
        Self {
            records,
            keys,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn chain_lock(&self, org_id: &str, uapk_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry((org_id.to_string(), uapk_id.to_string()))
                .or_default(),
        )
    }

    /// Append a draft to its chain.
    ///
    /// Runs under the per-`(org, uapk)` serial lock: the previous hash read
    /// here is never stale by the time the record persists.
    ///
    /// # Errors
    ///
    /// Propagates canonicalisation and store failures.
    pub async fn append(&self, draft: RecordDraft) -> Result<InteractionRecord, AuditError> {
        let lock = self.chain_lock(&draft.org_id, &draft.uapk_id).await;
        let _guard = lock.lock().await;

        let previous = self
            .records
            .last_record_hash(&draft.org_id, &draft.uapk_id)
            .await?
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let record = seal(&self.keys, draft, &previous)?;
        self.records.append_record(record.clone()).await?;
        debug!(
            record_id = %record.record_id,
            org_id = %record.org_id,
            uapk_id = %record.uapk_id,
            decision = ?record.decision,
            "interaction record appended"
        );
        Ok(record)
    }

    /// Verify one chain in insertion order, stopping at the first mismatch.
    ///
    /// # Errors
    ///
    /// Propagates store failures; a broken chain is a report, not an error.
    pub async fn verify(&self, org_id: &str, uapk_id: &str) -> Result<ChainReport, AuditError> {
        let records = self.records.chain_records(org_id, uapk_id).await?;
        Ok(verify_records(&self.keys, uapk_id, &records))
    }

    /// Verify every chain of an organisation.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn verify_all(&self, org_id: &str) -> Result<Vec<ChainReport>, AuditError> {
        let mut reports = Vec::new();
        for uapk_id in self.records.chain_keys(org_id).await? {
            reports.push(self.verify(org_id, &uapk_id).await?);
        }
        Ok(reports)
    }

    /// Export an organisation's records in a date range as a tar.gz bundle.
    ///
    /// # Errors
    ///
    /// Propagates store and serialization failures.
    pub async fn export(
        &self,
        org_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<ExportBundle, AuditError> {
        let filter = RecordFilter {
            uapk_id: None,
            from,
            to,
            limit: None,
            offset: None,
        };
        let records = self.records.list_records(org_id, &filter).await?;
        let reports = self.verify_all(org_id).await?;
        export::build_bundle(&self.keys, &records, &reports)
    }
}

/// Compute the derived fields and produce the sealed record.
fn seal(
    keys: &KeyManager,
    draft: RecordDraft,
    previous_record_hash: &str,
) -> Result<InteractionRecord, AuditError> {
    let mut record = InteractionRecord {
        record_id: draft.record_id,
        org_id: draft.org_id,
        uapk_id: draft.uapk_id,
        agent_id: draft.agent_id,
        action: draft.action,
        request_hash: draft.request_hash,
        decision: draft.decision,
        reasons: draft.reasons,
        policy_trace: draft.policy_trace,
        executed: draft.executed,
        result: draft.result,
        approval_id: draft.approval_id,
        context: draft.context,
        previous_record_hash: previous_record_hash.to_string(),
        record_hash: String::new(),
        gateway_signature: String::new(),
        key_id: keys.key_id().map(str::to_string),
        created_at: draft.created_at,
    };
    let hash = record_hash(&record, previous_record_hash)?;
    record.gateway_signature = keys.sign_b64(hash.as_bytes());
    record.record_hash = hash;
    Ok(record)
}

/// The canonical bytes of a record minus the three derived fields.
fn canonical_body(record: &InteractionRecord) -> Result<String, apg_canon::CanonError> {
    let mut value = serde_json::to_value(record).unwrap_or_default();
    if let serde_json::Value::Object(map) = &mut value {
        map.remove("record_hash");
        map.remove("gateway_signature");
        map.remove("previous_record_hash");
    }
    apg_canon::canonicalize(&value)
}

/// `SHA256(canonical(record minus derived fields) || previous_record_hash)`.
fn record_hash(
    record: &InteractionRecord,
    previous_record_hash: &str,
) -> Result<String, apg_canon::CanonError> {
    let mut bytes = canonical_body(record)?.into_bytes();
    bytes.extend_from_slice(previous_record_hash.as_bytes());
    Ok(apg_canon::sha256_hex(&bytes))
}

/// Verify an in-memory slice of records that form one chain.
#[must_use]
pub fn verify_records(
    keys: &KeyManager,
    uapk_id: &str,
    records: &[InteractionRecord],
) -> ChainReport {
    let mut signature_valid_count = 0;
    let mut expected_previous = GENESIS_HASH.to_string();

    for (index, record) in records.iter().enumerate() {
        if record.previous_record_hash != expected_previous {
            warn!(uapk_id, index, "audit chain link broken");
            return ChainReport {
                uapk_id: uapk_id.to_string(),
                valid: false,
                record_count: records.len(),
                signature_valid_count,
                mismatch: Some(ChainMismatch {
                    index,
                    expected: expected_previous,
                    got: record.previous_record_hash.clone(),
                }),
            };
        }
        let recomputed = match record_hash(record, &record.previous_record_hash) {
            Ok(h) => h,
            Err(_) => record.record_hash.clone(),
        };
        if recomputed != record.record_hash {
            warn!(uapk_id, index, "audit record hash mismatch");
            return ChainReport {
                uapk_id: uapk_id.to_string(),
                valid: false,
                record_count: records.len(),
                signature_valid_count,
                mismatch: Some(ChainMismatch {
                    index,
                    expected: recomputed,
                    got: record.record_hash.clone(),
                }),
            };
        }
        if keys.verify_b64(record.record_hash.as_bytes(), &record.gateway_signature) {
            signature_valid_count += 1;
        } else {
            warn!(uapk_id, index, "audit record signature invalid");
            return ChainReport {
                uapk_id: uapk_id.to_string(),
                valid: false,
                record_count: records.len(),
                signature_valid_count,
                mismatch: Some(ChainMismatch {
                    index,
                    expected: "valid signature".into(),
                    got: "invalid signature".into(),
                }),
            };
        }
        expected_previous = record.record_hash.clone();
    }

    ChainReport {
        uapk_id: uapk_id.to_string(),
        valid: true,
        record_count: records.len(),
        signature_valid_count,
        mismatch: None,
    }
}
