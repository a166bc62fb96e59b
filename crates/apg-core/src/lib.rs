// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! apg-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the Agent Policy Gateway.

/// Approval lifecycle records.
pub mod approval;
/// Decision reasons, codes, and policy traces.
pub mod reason;
/// Interaction records and execution results.
pub mod record;
/// Gateway request and response envelopes.
pub mod request;

pub use approval::{Approval, ApprovalStatus};
pub use reason::{Decision, DecisionKind, Reason, ReasonCode, StageOutcome, TraceEntry};
pub use record::{ExecutionError, ExecutionResult, InteractionRecord};
pub use request::{DecisionResponse, ErrorBody, ErrorEnvelope, ExecuteResponse, GatewayRequest};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current contract version string embedded in responses and exports.
///
/// # Examples
///
/// ```
/// assert_eq!(apg_core::CONTRACT_VERSION, "apg/v0.1");
/// ```
pub const CONTRACT_VERSION: &str = "apg/v0.1";

/// Previous-record hash used for the first entry of an audit chain:
/// 32 zero bytes, hex encoded.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One proposed agent action.
///
/// This is the unit the gateway decides on. The cryptographic identity of an
/// action is the SHA-256 of its canonical form over `{type, tool, params,
/// amount?, currency?}` — `description`, counterparty, and request context do
/// not participate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Action {
    /// Action type tag (e.g. `"payment"`, `"email"`).
    #[serde(rename = "type")]
    pub action_type: String,

    /// Tool the agent wants to invoke; must be configured in the manifest.
    pub tool: String,

    /// Tool parameters.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,

    /// Monetary amount, when the action moves value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,

    /// ISO 4217 currency code for `amount`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,

    /// Free-text description; excluded from the action hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The party on the other side of an action, when one exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Counterparty {
    /// Stable identifier, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Contact address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Web domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Jurisdiction code (e.g. `"DE"`, `"US-CA"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`Manifest`].
///
/// At most one manifest per `(org_id, uapk_id)` is `Active`; activating a
/// successor demotes the predecessor to `Inactive` in the same store
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManifestStatus {
    /// Uploaded but not yet activated; never consulted by the gateway.
    Pending,
    /// The manifest the gateway enforces.
    Active,
    /// Superseded by a later activation.
    Inactive,
}

/// Signed policy artefact for one agent type within one organisation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Manifest {
    /// Owning organisation.
    pub org_id: String,
    /// Stable identifier for the manifest family.
    pub uapk_id: String,
    /// Monotonic version within the family.
    pub version: u32,
    /// Lifecycle status.
    pub status: ManifestStatus,
    /// Policy and tool configuration.
    pub content: ManifestContent,
    /// SHA-256 of the canonical content, computed on load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// The body of a manifest: raw policy document plus tool configurations.
///
/// The policy document is kept as raw JSON here; the manifest resolver
/// normalises it into a [`PolicyConfig`] so downstream code sees one shape
/// regardless of which naming convention the author used.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ManifestContent {
    /// Policy document as authored.
    #[serde(default)]
    pub policy: serde_json::Value,
    /// Tool configurations keyed by tool name.
    #[serde(default)]
    pub tools: BTreeMap<String, ToolConfig>,
}

// ---------------------------------------------------------------------------
// Policy configuration (normalised)
// ---------------------------------------------------------------------------

/// Normalised policy shape consumed by the decision pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PolicyConfig {
    /// Action types the manifest admits. Empty means unrestricted.
    #[serde(default)]
    pub allowed_action_types: Vec<String>,
    /// Tools the manifest admits. Empty means unrestricted.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tools the manifest explicitly denies. Checked before the allowlist.
    #[serde(default)]
    pub denied_tools: Vec<String>,
    /// Counterparty jurisdictions the manifest admits. Empty means unrestricted.
    #[serde(default)]
    pub allowed_jurisdictions: Vec<String>,
    /// Counterparty identifiers/domains the manifest admits.
    #[serde(default)]
    pub counterparty_allowlist: Vec<String>,
    /// Counterparty identifiers/domains the manifest denies.
    #[serde(default)]
    pub counterparty_denylist: Vec<String>,
    /// Monetary ceilings and where to find amounts in params.
    #[serde(default)]
    pub amount_caps: AmountCaps,
    /// Conditions that force human approval.
    #[serde(default)]
    pub approval_thresholds: ApprovalThresholds,
    /// Daily action budgets.
    #[serde(default)]
    pub budgets: Budgets,
    /// Whether every request must present a capability token.
    #[serde(default)]
    pub require_capability_token: bool,
}

/// Monetary caps applied to an action's numeric amount.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AmountCaps {
    /// Hard ceiling; amounts strictly above are denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<f64>,
    /// Soft ceiling; amounts strictly above escalate for approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_above: Option<f64>,
    /// Dot paths into `action.params` searched for an amount when
    /// `action.amount` is absent.
    #[serde(default)]
    pub param_paths: Vec<String>,
    /// Param field naming the currency, for audit context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency_field: Option<String>,
}

/// Conditions under which an otherwise-allowed action escalates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalThresholds {
    /// Numeric amounts at or above this require approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    /// Action types that always require approval.
    #[serde(default)]
    pub action_types: Vec<String>,
    /// Tools that always require approval.
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Daily budget limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Budgets {
    /// Maximum executed actions per UTC day for this `(org, uapk)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_cap: Option<u64>,
    /// Fraction of the cap at which decisions start escalating (default 0.9).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_percent: Option<f64>,
}

// ---------------------------------------------------------------------------
// Tool configuration
// ---------------------------------------------------------------------------

/// Connector variant for a configured tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Deterministic in-process connector; no network. Used in tests.
    Mock,
    /// Templated outbound HTTP call.
    Http,
    /// JSON POST to a single URL.
    Webhook,
}

/// Per-tool connector configuration embedded in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolConfig {
    /// Which connector executes this tool.
    #[serde(rename = "type")]
    pub kind: ToolKind,
    /// Target URL (may contain `{placeholders}` for the http connector).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// HTTP method; defaults to POST.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Extra request headers. Values may be secret references.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Domains this tool may reach, unioned with the global allowlist.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Request timeout override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Response size ceiling override in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_bytes: Option<u64>,
    /// Vault keys to resolve and inject at call time.
    #[serde(default)]
    pub secret_refs: Vec<String>,
    /// Canned response for the mock connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_response: Option<serde_json::Value>,
}

impl ToolConfig {
    /// A mock tool returning `response`.
    #[must_use]
    pub fn mock(response: serde_json::Value) -> Self {
        Self {
            kind: ToolKind::Mock,
            url: None,
            method: None,
            headers: BTreeMap::new(),
            allowed_domains: Vec::new(),
            timeout_ms: None,
            max_response_bytes: None,
            secret_refs: Vec::new(),
            mock_response: Some(response),
        }
    }
}
