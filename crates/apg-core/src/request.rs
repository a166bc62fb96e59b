// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request and response envelopes for the gateway HTTP surface.

use crate::reason::{DecisionKind, Reason};
use crate::record::ExecutionResult;
use crate::{Action, Counterparty};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical request body for `POST /gateway/evaluate` and
/// `POST /gateway/execute`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayRequest {
    /// Manifest family to evaluate against.
    pub uapk_id: String,
    /// Agent proposing the action.
    pub agent_id: String,
    /// The proposed action.
    pub action: Action,
    /// Counterparty, when the action has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty: Option<Counterparty>,
    /// Delegated capability token, compact form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_token: Option<String>,
    /// Approval-bound override token, compact form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_token: Option<String>,
    /// Opaque caller context; audited but never hashed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// Response body for a dry-run evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DecisionResponse {
    /// Identifier of the appended interaction record.
    pub interaction_id: Uuid,
    /// Final decision.
    pub decision: DecisionKind,
    /// Reasons accumulated during evaluation.
    pub reasons: Vec<Reason>,
    /// Approval created (or reused) for an escalation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,
    /// Content hash of the manifest the decision was made under.
    pub policy_version: String,
    /// Decision timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Response body for a full execution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteResponse {
    /// The decision portion, identical in shape to [`DecisionResponse`].
    #[serde(flatten)]
    pub decision: DecisionResponse,
    /// Whether a connector was invoked.
    pub executed: bool,
    /// Connector outcome, when executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
}

/// Standard error payload: `{"error": {"code", "message", "details"}}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ErrorEnvelope {
    /// The error body.
    pub error: ErrorBody,
}

/// Body of an [`ErrorEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ErrorBody {
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorEnvelope {
    /// Build an envelope without details.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_response_flattens_decision() {
        let resp = ExecuteResponse {
            decision: DecisionResponse {
                interaction_id: Uuid::new_v4(),
                decision: DecisionKind::Allow,
                reasons: Vec::new(),
                approval_id: None,
                policy_version: "abc".into(),
                timestamp: Utc::now(),
            },
            executed: true,
            result: Some(ExecutionResult {
                success: true,
                data: None,
                error: None,
                result_hash: None,
                status_code: Some(200),
                duration_ms: 3,
            }),
        };
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["decision"], "ALLOW");
        assert_eq!(v["executed"], true);
        assert!(v.get("interaction_id").is_some());
    }

    #[test]
    fn error_envelope_shape() {
        let v = serde_json::to_value(ErrorEnvelope::new("RATE_LIMITED", "slow down")).unwrap();
        assert_eq!(v["error"]["code"], "RATE_LIMITED");
        assert!(v["error"].get("details").is_none());
    }
}
