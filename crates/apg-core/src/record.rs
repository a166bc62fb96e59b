// SPDX-License-Identifier: MIT OR Apache-2.0
//! Interaction records: one audit-chain entry per gateway decision.

use crate::reason::{DecisionKind, Reason, TraceEntry};
use crate::Action;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error detail reported by a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionError {
    /// Stable code (e.g. `"SSRF_DNS_DRIFT"`, `"CONNECTOR_TIMEOUT"`).
    pub code: String,
    /// Human-readable message. Never contains secret material.
    pub message: String,
}

/// Outcome of one connector invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionResult {
    /// Whether the tool call succeeded.
    pub success: bool,
    /// Response payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error detail on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// SHA-256 over the canonical response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_hash: Option<String>,
    /// Upstream HTTP status, when the connector spoke HTTP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Wall-clock connector duration in milliseconds.
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// A failed result with the given code and message.
    pub fn failure(code: impl Into<String>, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ExecutionError {
                code: code.into(),
                message: message.into(),
            }),
            result_hash: None,
            status_code: None,
            duration_ms,
        }
    }
}

/// One audit-chain entry: the decision, what was executed, and the hash link.
///
/// `record_hash` is `SHA256(canonical(record minus record_hash,
/// gateway_signature, previous_record_hash) || previous_record_hash)`, and
/// `gateway_signature` is the Ed25519 signature over the hex hash. Records on
/// the same `(org_id, uapk_id)` chain are totally ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InteractionRecord {
    /// Unique record identifier.
    pub record_id: Uuid,
    /// Owning organisation.
    pub org_id: String,
    /// Manifest family the decision was made under.
    pub uapk_id: String,
    /// Agent that proposed the action.
    pub agent_id: String,
    /// The proposed action, as received.
    pub action: Action,
    /// Action hash at request time (hex SHA-256).
    pub request_hash: String,
    /// Final decision.
    pub decision: DecisionKind,
    /// Reasons accumulated during evaluation.
    pub reasons: Vec<Reason>,
    /// Ordered stage trace.
    pub policy_trace: Vec<TraceEntry>,
    /// Whether a connector was invoked.
    pub executed: bool,
    /// Connector outcome, when executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    /// Approval linked to this interaction, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,
    /// Opaque caller context; excluded from `request_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    /// Hash of the previous record on this chain, or the genesis constant.
    pub previous_record_hash: String,
    /// This record's chain hash.
    pub record_hash: String,
    /// Ed25519 signature over `record_hash`, base64.
    pub gateway_signature: String,
    /// Identifier of the signing key. Reserved for rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Append timestamp.
    pub created_at: DateTime<Utc>,
}
