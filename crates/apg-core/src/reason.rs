// SPDX-License-Identifier: MIT OR Apache-2.0
//! Decision kinds, reason codes, and the per-stage policy trace.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Outcome of a full policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    /// The gateway will execute the action.
    Allow,
    /// The action is refused.
    Deny,
    /// Human approval is required before the action may run.
    Escalate,
}

/// Machine-readable, stable reason and error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    // -- Manifest --
    /// No ACTIVE manifest exists for the requested `(org, uapk)`.
    ManifestNotFound,
    /// The referenced manifest is not ACTIVE.
    ManifestInactive,
    /// The requested tool has no configuration in the manifest.
    ToolNotConfigured,

    // -- Tokens --
    /// The policy requires a capability token and none was supplied.
    CapabilityRequired,
    /// The capability token failed verification or identity binding.
    CapabilityTokenInvalid,
    /// The capability token is outside its validity window.
    CapabilityTokenExpired,
    /// The override token failed verification.
    OverrideTokenInvalid,
    /// The override token is past its expiry.
    OverrideTokenExpired,
    /// The referenced approval was already consumed.
    OverrideTokenAlreadyUsed,
    /// The override token binds a different action hash.
    OverrideTokenActionMismatch,
    /// The approval belongs to a different agent.
    OverrideTokenWrongIdentity,
    /// A valid override token converted an escalation into an allow.
    OverrideTokenAccepted,

    // -- Policy --
    /// The action type is not admitted by manifest or token.
    ActionTypeDenied,
    /// The tool is denied or missing from an allowlist.
    ToolNotAllowed,
    /// The action amount exceeds the hard cap.
    AmountCapExceeded,
    /// An approval threshold fired; human sign-off required.
    ApprovalRequired,
    /// The counterparty jurisdiction is not admitted.
    JurisdictionDenied,
    /// The counterparty is denied or missing from an allowlist.
    CounterpartyDenied,
    /// Today's daily action budget is exhausted.
    BudgetExceeded,
    /// The daily budget is close to its cap.
    BudgetNearLimit,

    // -- Execution --
    /// The connector call exceeded its timeout.
    ConnectorTimeout,
    /// The connector call failed.
    ConnectorFailed,
    /// The response body exceeded the size ceiling.
    ResponseTooLarge,
    /// A resolved address fell in a forbidden range.
    SsrfBlocked,
    /// DNS resolution changed between validation and dispatch.
    SsrfDnsDrift,
    /// The target domain is not on any allowlist.
    DomainNotAllowed,
    /// The caller abandoned the request mid-execution.
    ClientCancelled,

    // -- Transport --
    /// Too many requests in the current window.
    RateLimited,
    /// The request body exceeded the configured cap.
    PayloadTooLarge,
    /// Missing or unrecognised credentials.
    Unauthenticated,
    /// Authenticated but not permitted for this resource.
    Unauthorised,
    /// The request body failed to parse or validate.
    MalformedRequest,
    /// Unexpected gateway-side fault.
    Internal,
}

/// One reason attached to a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Reason {
    /// Stable code.
    pub code: ReasonCode,
    /// Human-readable explanation.
    pub message: String,
    /// Structured context for operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Reason {
    /// Build a reason without details.
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Build a reason carrying structured details.
    pub fn with_details(
        code: ReasonCode,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }
}

/// How a single pipeline stage concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// The stage found nothing to object to.
    Pass,
    /// The stage denied the action.
    Deny,
    /// The stage requested escalation.
    Escalate,
    /// The stage did not apply to this request.
    Skip,
}

/// One entry of the ordered policy trace retained in the audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TraceEntry {
    /// Stage name (e.g. `"tool_allowlist"`).
    pub stage: String,
    /// Stage outcome.
    pub result: StageOutcome,
    /// Optional short detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TraceEntry {
    /// Build a trace entry.
    pub fn new(stage: impl Into<String>, result: StageOutcome) -> Self {
        Self {
            stage: stage.into(),
            result,
            detail: None,
        }
    }

    /// Attach a detail string.
    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The full result of the decision pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Decision {
    /// Final decision kind.
    pub kind: DecisionKind,
    /// Reasons accumulated across stages.
    pub reasons: Vec<Reason>,
    /// Ordered per-stage trace.
    pub policy_trace: Vec<TraceEntry>,
    /// True when at least one stage escalated.
    pub approval_required: bool,
    /// True when a valid override token was presented.
    pub override_accepted: bool,
}

impl Decision {
    /// An unconditional allow with an empty trace.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            kind: DecisionKind::Allow,
            reasons: Vec::new(),
            policy_trace: Vec::new(),
            approval_required: false,
            override_accepted: false,
        }
    }

    /// A denial carrying a single reason.
    #[must_use]
    pub fn deny(reason: Reason) -> Self {
        Self {
            kind: DecisionKind::Deny,
            reasons: vec![reason],
            policy_trace: Vec::new(),
            approval_required: false,
            override_accepted: false,
        }
    }

    /// Returns `true` if the decision permits execution.
    #[must_use]
    pub fn is_allow(&self) -> bool {
        self.kind == DecisionKind::Allow
    }
}
