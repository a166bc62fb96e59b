// SPDX-License-Identifier: MIT OR Apache-2.0
//! Approval lifecycle records for escalated actions.

use crate::Action;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an [`Approval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    /// Awaiting an operator decision.
    Pending,
    /// Approved; an override token was issued.
    Approved,
    /// Refused by an operator.
    Denied,
    /// Lapsed without a decision.
    Expired,
}

impl ApprovalStatus {
    /// Returns `true` if no further transitions are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Denied | Self::Expired)
    }
}

/// Record of one escalated action awaiting (or past) human sign-off.
///
/// `action_hash` is immutable and equals the canonical hash of `action`;
/// `consumed_at` is set exactly once, and only while the approval is
/// APPROVED and unexpired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Approval {
    /// Unique approval identifier.
    pub approval_id: Uuid,
    /// Owning organisation.
    pub org_id: String,
    /// Manifest family.
    pub uapk_id: String,
    /// Agent whose action escalated.
    pub agent_id: String,
    /// Full copy of the escalated action.
    pub action: Action,
    /// Canonical hash of `action` (hex SHA-256).
    pub action_hash: String,
    /// Lifecycle status.
    pub status: ApprovalStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Hard expiry; consumption past this instant always fails.
    pub expires_at: DateTime<Utc>,
    /// When an operator decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    /// Operator principal that decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    /// When the one-time consumption happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<DateTime<Utc>>,
    /// Interaction record that consumed this approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_interaction_id: Option<Uuid>,
    /// SHA-256 of the issued override token, for audit correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_token_hash: Option<String>,
}

impl Approval {
    /// Returns `true` if the approval can still be consumed at `now`.
    #[must_use]
    pub fn consumable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Approved && self.consumed_at.is_none() && now < self.expires_at
    }
}
