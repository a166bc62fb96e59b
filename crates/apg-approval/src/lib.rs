// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! apg-approval
#![deny(unsafe_code)]
#![warn(missing_docs)]

use apg_core::{Action, Approval, ApprovalStatus};
use apg_keys::KeyManager;
use apg_store::ApprovalStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Default approval lifetime.
pub const DEFAULT_APPROVAL_TTL: Duration = Duration::hours(24);

/// Errors from approval operations.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// No approval with that id in this organisation.
    #[error("approval not found")]
    NotFound,
    /// The approval is not in a state that permits the operation.
    #[error("invalid approval state: {0}")]
    InvalidState(String),
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] apg_store::StoreError),
}

/// An approval together with the override token minted at approval time.
///
/// The token itself is returned exactly once, on this response; only its
/// hash is persisted.
#[derive(Debug, Clone)]
pub struct ApprovedOutcome {
    /// The approved row.
    pub approval: Approval,
    /// Compact override token bound to the approved action.
    pub override_token: String,
}

/// Approval lifecycle service over an [`ApprovalStore`].
pub struct ApprovalService {
    store: Arc<dyn ApprovalStore>,
    keys: Arc<KeyManager>,
    approval_ttl: Duration,
    override_ttl: Duration,
}

impl ApprovalService {
    /// Build a service.
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        keys: Arc<KeyManager>,
        approval_ttl: Duration,
        override_ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            approval_ttl,
            override_ttl,
        }
    }

    /// Create a pending approval for an escalated action, or return the
    /// existing unexpired PENDING approval for the same `(org, uapk, agent,
    /// action)` so repeated escalations do not stack.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn create_or_reuse(
        &self,
        org_id: &str,
        uapk_id: &str,
        agent_id: &str,
        action: &Action,
        now: DateTime<Utc>,
    ) -> Result<Approval, ApprovalError> {
        let action_hash = apg_canon::action_hash_hex(action);
        if let Some(existing) = self
            .store
            .find_reusable_pending(org_id, uapk_id, agent_id, &action_hash, now)
            .await?
        {
            return Ok(existing);
        }

        let approval = Approval {
            approval_id: Uuid::new_v4(),
            org_id: org_id.to_string(),
            uapk_id: uapk_id.to_string(),
            agent_id: agent_id.to_string(),
            action: action.clone(),
            action_hash,
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + self.approval_ttl,
            decided_at: None,
            decided_by: None,
            consumed_at: None,
            consumed_interaction_id: None,
            override_token_hash: None,
        };
        self.store.insert_approval(approval.clone()).await?;
        info!(
            approval_id = %approval.approval_id,
            org_id,
            uapk_id,
            "approval created"
        );
        Ok(approval)
    }

    /// Fetch one approval.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotFound`] when absent.
    pub async fn get(&self, org_id: &str, approval_id: Uuid) -> Result<Approval, ApprovalError> {
        self.store
            .get_approval(org_id, approval_id)
            .await?
            .ok_or(ApprovalError::NotFound)
    }

    /// List an organisation's approvals, optionally filtered by status.
    /// Expired PENDING rows are reaped first, so listings never show a
    /// pending approval that can no longer be decided.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list(
        &self,
        org_id: &str,
        status: Option<ApprovalStatus>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Approval>, ApprovalError> {
        self.store.expire_stale_approvals(org_id, now).await?;
        Ok(self.store.list_approvals(org_id, status).await?)
    }

    /// Approve a PENDING approval and mint its override token.
    ///
    /// The token is issued before the conditional transition so that the
    /// stored `override_token_hash` lands in the same update; if the
    /// transition loses a race the token is discarded.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::InvalidState`] when the approval is not PENDING or
    /// already lapsed.
    pub async fn approve(
        &self,
        org_id: &str,
        approval_id: Uuid,
        decided_by: &str,
        now: DateTime<Utc>,
    ) -> Result<ApprovedOutcome, ApprovalError> {
        let approval = self.get(org_id, approval_id).await?;
        if approval.status != ApprovalStatus::Pending {
            return Err(ApprovalError::InvalidState(format!(
                "approval is {:?}",
                approval.status
            )));
        }
        if now >= approval.expires_at {
            return Err(ApprovalError::InvalidState("approval expired".into()));
        }

        let token = apg_token::issue_override(
            &self.keys,
            approval_id,
            &approval.action_hash,
            self.override_ttl,
            now,
        );
        let token_hash = apg_canon::sha256_hex(token.as_bytes());

        let updated = self
            .store
            .decide_approval(
                org_id,
                approval_id,
                ApprovalStatus::Approved,
                decided_by,
                now,
                Some(token_hash),
            )
            .await
            .map_err(|e| match e {
                apg_store::StoreError::Conflict(msg) => ApprovalError::InvalidState(msg),
                apg_store::StoreError::NotFound => ApprovalError::NotFound,
                other => ApprovalError::Store(other),
            })?;

        info!(approval_id = %approval_id, decided_by, "approval granted");
        Ok(ApprovedOutcome {
            approval: updated,
            override_token: token,
        })
    }

    /// Deny a PENDING approval.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::InvalidState`] when the approval is not PENDING.
    pub async fn deny(
        &self,
        org_id: &str,
        approval_id: Uuid,
        decided_by: &str,
        now: DateTime<Utc>,
    ) -> Result<Approval, ApprovalError> {
        let updated = self
            .store
            .decide_approval(
                org_id,
                approval_id,
                ApprovalStatus::Denied,
                decided_by,
                now,
                None,
            )
            .await
            .map_err(|e| match e {
                apg_store::StoreError::Conflict(msg) => ApprovalError::InvalidState(msg),
                apg_store::StoreError::NotFound => ApprovalError::NotFound,
                other => ApprovalError::Store(other),
            })?;
        info!(approval_id = %approval_id, decided_by, "approval denied");
        Ok(updated)
    }

    /// Atomically consume an approval for `interaction_id`. True iff this
    /// call won the one-time consumption.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn consume_if_valid(
        &self,
        approval_id: Uuid,
        interaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ApprovalError> {
        Ok(self
            .store
            .consume_approval(approval_id, interaction_id, now)
            .await?)
    }
}
