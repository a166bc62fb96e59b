// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! apg-policy
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod budget;
mod extract;

pub use budget::{BudgetClaim, BudgetGate, PeekGate, ReservingGate};
pub use extract::extract_amount;

use apg_core::{
    Action, Counterparty, Decision, DecisionKind, Reason, ReasonCode, StageOutcome, TraceEntry,
};
use apg_keys::KeyManager;
use apg_manifest::ResolvedManifest;
use apg_store::ApprovalStore;
use apg_token::TokenError;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Default fraction of the daily cap at which decisions start escalating.
pub const DEFAULT_ESCALATE_PERCENT: f64 = 0.9;

/// Everything the pipeline needs to decide one request.
pub struct PolicyContext<'a> {
    /// Organisation the request is scoped to.
    pub org_id: &'a str,
    /// Manifest family.
    pub uapk_id: &'a str,
    /// Agent proposing the action.
    pub agent_id: &'a str,
    /// The proposed action.
    pub action: &'a Action,
    /// Counterparty, when the action has one.
    pub counterparty: Option<&'a Counterparty>,
    /// Compact capability token, when supplied.
    pub capability_token: Option<&'a str>,
    /// Compact override token, when supplied.
    pub override_token: Option<&'a str>,
    /// The resolved ACTIVE manifest, when one exists.
    pub manifest: Option<&'a ResolvedManifest>,
}

/// Pipeline output: the decision plus what the gateway needs for follow-up.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// The decision with reasons and trace.
    pub decision: Decision,
    /// Hex action hash computed during evaluation.
    pub action_hash: String,
    /// Approval behind an accepted override token.
    pub override_approval_id: Option<Uuid>,
    /// Whether a budget slot was actually reserved and may need release.
    pub budget_reserved: bool,
    /// UTC date the reservation was made under.
    pub budget_date: NaiveDate,
}

/// Failures that are gateway faults rather than policy outcomes.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Storage failure during approval lookup or budget reservation.
    #[error(transparent)]
    Store(#[from] apg_store::StoreError),
}

/// Tunables the engine applies when a manifest is silent.
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    /// Daily cap applied when the manifest configures none.
    pub default_daily_cap: Option<u64>,
    /// Near-limit escalation fraction.
    pub escalate_percent: f64,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            default_daily_cap: None,
            escalate_percent: DEFAULT_ESCALATE_PERCENT,
        }
    }
}

/// The decision pipeline.
///
/// Stages run in a fixed order. A deny stops evaluation immediately;
/// escalations accumulate; a valid override token converts a pending
/// escalation into an allow at the end, but never overrides a deny.
pub struct PolicyEngine {
    keys: Arc<KeyManager>,
    approvals: Arc<dyn ApprovalStore>,
    defaults: EngineDefaults,
}

/// Internal accumulator threaded through the stages.
struct Pipeline {
    reasons: Vec<Reason>,
    trace: Vec<TraceEntry>,
    escalated: bool,
    override_accepted: bool,
    override_approval_id: Option<Uuid>,
}

impl Pipeline {
    fn new() -> Self {
        Self {
            reasons: Vec::new(),
            trace: Vec::new(),
            escalated: false,
            override_accepted: false,
            override_approval_id: None,
        }
    }

    fn pass(&mut self, stage: &str) {
        self.trace.push(TraceEntry::new(stage, StageOutcome::Pass));
    }

    fn skip(&mut self, stage: &str) {
        self.trace.push(TraceEntry::new(stage, StageOutcome::Skip));
    }

    fn escalate(&mut self, stage: &str, reason: Reason) {
        self.trace.push(
            TraceEntry::new(stage, StageOutcome::Escalate).detail(reason.message.clone()),
        );
        self.reasons.push(reason);
        self.escalated = true;
    }

    fn deny(mut self, stage: &str, reason: Reason) -> Decision {
        self.trace
            .push(TraceEntry::new(stage, StageOutcome::Deny).detail(reason.message.clone()));
        self.reasons.push(reason);
        Decision {
            kind: DecisionKind::Deny,
            reasons: self.reasons,
            policy_trace: self.trace,
            approval_required: false,
            override_accepted: self.override_accepted,
        }
    }

    fn finish(mut self) -> Decision {
        if self.escalated && self.override_accepted {
            // Stage 13: a pre-approved action clears its own escalations.
            self.trace.push(
                TraceEntry::new("override_resolution", StageOutcome::Pass)
                    .detail("escalation converted to allow"),
            );
            self.reasons.push(Reason::new(
                ReasonCode::OverrideTokenAccepted,
                "override token accepted; escalation converted to allow",
            ));
            return Decision {
                kind: DecisionKind::Allow,
                reasons: self.reasons,
                policy_trace: self.trace,
                approval_required: false,
                override_accepted: true,
            };
        }
        if self.escalated {
            return Decision {
                kind: DecisionKind::Escalate,
                reasons: self.reasons,
                policy_trace: self.trace,
                approval_required: true,
                override_accepted: self.override_accepted,
            };
        }
        Decision {
            kind: DecisionKind::Allow,
            reasons: self.reasons,
            policy_trace: self.trace,
            approval_required: false,
            override_accepted: self.override_accepted,
        }
    }
}

impl PolicyEngine {
    /// Build an engine.
    pub fn new(
        keys: Arc<KeyManager>,
        approvals: Arc<dyn ApprovalStore>,
        defaults: EngineDefaults,
    ) -> Self {
        Self {
            keys,
            approvals,
            defaults,
        }
    }

    /// Run the pipeline.
    ///
    /// The budget stage claims through `gate`; callers that must not mutate
    /// state (dry runs) pass a [`PeekGate`].
    ///
    /// # Errors
    ///
    /// [`PolicyError::Store`] when a store read or the budget claim fails;
    /// policy outcomes themselves are never errors.
    pub async fn evaluate(
        &self,
        ctx: &PolicyContext<'_>,
        gate: &dyn BudgetGate,
        now: DateTime<Utc>,
    ) -> Result<Evaluation, PolicyError> {
        let action_hash = apg_canon::action_hash_hex(ctx.action);
        let budget_date = now.date_naive();
        let mut p = Pipeline::new();

        // Stage 1: manifest presence.
        let Some(manifest) = ctx.manifest else {
            return Ok(Evaluation {
                decision: p.deny(
                    "manifest",
                    Reason::new(
                        ReasonCode::ManifestNotFound,
                        format!("no active manifest for uapk '{}'", ctx.uapk_id),
                    ),
                ),
                action_hash,
                override_approval_id: None,
                budget_reserved: false,
                budget_date,
            });
        };
        p.pass("manifest");
        let policy = &manifest.policy;

        // Stage 2: capability token verification and identity binding.
        let mut capability = None;
        if let Some(token) = ctx.capability_token {
            match apg_token::verify_capability(&self.keys, token, now) {
                Ok(claims) => {
                    if claims.org_id != ctx.org_id
                        || claims.uapk_id != ctx.uapk_id
                        || claims.sub != ctx.agent_id
                    {
                        return Ok(self.done(
                            p.deny(
                                "capability_token",
                                Reason::new(
                                    ReasonCode::CapabilityTokenInvalid,
                                    "capability token bound to a different identity",
                                ),
                            ),
                            action_hash,
                            budget_date,
                        ));
                    }
                    p.pass("capability_token");
                    capability = Some(claims);
                }
                Err(TokenError::Expired) => {
                    return Ok(self.done(
                        p.deny(
                            "capability_token",
                            Reason::new(
                                ReasonCode::CapabilityTokenExpired,
                                "capability token expired",
                            ),
                        ),
                        action_hash,
                        budget_date,
                    ));
                }
                Err(err) => {
                    return Ok(self.done(
                        p.deny(
                            "capability_token",
                            Reason::new(
                                ReasonCode::CapabilityTokenInvalid,
                                format!("capability token rejected: {err}"),
                            ),
                        ),
                        action_hash,
                        budget_date,
                    ));
                }
            }
        } else {
            p.skip("capability_token");
        }

        // Stage 3: override token pre-check. Acceptance is recorded but the
        // remaining stages still run so the trace is complete.
        if let Some(token) = ctx.override_token {
            match self.precheck_override(ctx, token, &action_hash, now).await? {
                Ok(approval_id) => {
                    p.pass("override_token");
                    p.override_accepted = true;
                    p.override_approval_id = Some(approval_id);
                }
                Err(reason) => {
                    return Ok(self.done(p.deny("override_token", reason), action_hash, budget_date));
                }
            }
        } else {
            p.skip("override_token");
        }

        // Stage 4: require-capability.
        if policy.require_capability_token && capability.is_none() {
            return Ok(self.done(
                p.deny(
                    "require_capability",
                    Reason::new(
                        ReasonCode::CapabilityRequired,
                        "policy requires a capability token",
                    ),
                ),
                action_hash,
                budget_date,
            ));
        }
        p.pass("require_capability");

        // Stage 5: action type, manifest and token allowlists both apply.
        let action_type = &ctx.action.action_type;
        if !policy.allowed_action_types.is_empty()
            && !policy.allowed_action_types.contains(action_type)
        {
            return Ok(self.done(
                p.deny(
                    "action_type",
                    Reason::new(
                        ReasonCode::ActionTypeDenied,
                        format!("action type '{action_type}' not admitted by manifest"),
                    ),
                ),
                action_hash,
                budget_date,
            ));
        }
        if let Some(claims) = &capability {
            if !claims.allowed_action_types.is_empty()
                && !claims.allowed_action_types.contains(action_type)
            {
                return Ok(self.done(
                    p.deny(
                        "action_type",
                        Reason::new(
                            ReasonCode::ActionTypeDenied,
                            format!("action type '{action_type}' not admitted by capability token"),
                        ),
                    ),
                    action_hash,
                    budget_date,
                ));
            }
        }
        p.pass("action_type");

        // Stage 6: tool deny-then-allow, manifest and token.
        let tool = &ctx.action.tool;
        if policy.denied_tools.contains(tool) {
            return Ok(self.done(
                p.deny(
                    "tool_policy",
                    Reason::new(
                        ReasonCode::ToolNotAllowed,
                        format!("tool '{tool}' is explicitly denied"),
                    ),
                ),
                action_hash,
                budget_date,
            ));
        }
        if !policy.allowed_tools.is_empty() && !policy.allowed_tools.contains(tool) {
            return Ok(self.done(
                p.deny(
                    "tool_policy",
                    Reason::new(
                        ReasonCode::ToolNotAllowed,
                        format!("tool '{tool}' not in manifest allowlist"),
                    ),
                ),
                action_hash,
                budget_date,
            ));
        }
        if let Some(claims) = &capability {
            if !claims.allowed_tools.is_empty() && !claims.allowed_tools.contains(tool) {
                return Ok(self.done(
                    p.deny(
                        "tool_policy",
                        Reason::new(
                            ReasonCode::ToolNotAllowed,
                            format!("tool '{tool}' not admitted by capability token"),
                        ),
                    ),
                    action_hash,
                    budget_date,
                ));
            }
        }
        p.pass("tool_policy");

        // Stage 7: the tool must be configured.
        if !manifest.manifest.content.tools.contains_key(tool) {
            return Ok(self.done(
                p.deny(
                    "tool_configured",
                    Reason::new(
                        ReasonCode::ToolNotConfigured,
                        format!("tool '{tool}' has no connector configuration"),
                    ),
                ),
                action_hash,
                budget_date,
            ));
        }
        p.pass("tool_configured");

        // Stage 8: approval thresholds.
        let amount = extract_amount(ctx.action, &policy.amount_caps);
        let thresholds = &policy.approval_thresholds;
        let threshold_hit = thresholds.action_types.contains(action_type)
            || thresholds.tools.contains(tool)
            || matches!((thresholds.amount, amount), (Some(t), Some(a)) if a >= t);
        if threshold_hit {
            p.escalate(
                "approval_thresholds",
                Reason::with_details(
                    ReasonCode::ApprovalRequired,
                    "action requires human approval",
                    serde_json::json!({ "amount": amount }),
                ),
            );
        } else {
            p.pass("approval_thresholds");
        }

        // Stage 9: amount caps. At exactly max_amount the action passes; at
        // exactly escalate_above it escalates.
        if let Some(amount) = amount {
            if let Some(max) = policy.amount_caps.max_amount {
                if amount > max {
                    return Ok(self.done(
                        p.deny(
                            "amount_caps",
                            Reason::with_details(
                                ReasonCode::AmountCapExceeded,
                                format!("amount {amount} exceeds cap {max}"),
                                serde_json::json!({ "amount": amount, "max_amount": max }),
                            ),
                        ),
                        action_hash,
                        budget_date,
                    ));
                }
            }
            if let Some(soft) = policy.amount_caps.escalate_above {
                if amount >= soft {
                    p.escalate(
                        "amount_caps",
                        Reason::with_details(
                            ReasonCode::ApprovalRequired,
                            format!("amount {amount} above escalation threshold {soft}"),
                            serde_json::json!({ "amount": amount, "escalate_above": soft }),
                        ),
                    );
                } else {
                    p.pass("amount_caps");
                }
            } else {
                p.pass("amount_caps");
            }
        } else {
            p.skip("amount_caps");
        }

        // Stage 10: jurisdiction.
        if policy.allowed_jurisdictions.is_empty() {
            p.skip("jurisdiction");
        } else {
            match ctx.counterparty {
                Some(cp) => {
                    let admitted = cp
                        .jurisdiction
                        .as_ref()
                        .is_some_and(|j| policy.allowed_jurisdictions.contains(j));
                    if !admitted {
                        return Ok(self.done(
                            p.deny(
                                "jurisdiction",
                                Reason::new(
                                    ReasonCode::JurisdictionDenied,
                                    "counterparty jurisdiction not admitted",
                                ),
                            ),
                            action_hash,
                            budget_date,
                        ));
                    }
                    p.pass("jurisdiction");
                }
                None => p.skip("jurisdiction"),
            }
        }

        // Stage 11: counterparty deny-then-allow.
        match ctx.counterparty {
            Some(cp) => {
                let identifiers = counterparty_identifiers(cp);
                if identifiers
                    .iter()
                    .any(|id| policy.counterparty_denylist.contains(id))
                {
                    return Ok(self.done(
                        p.deny(
                            "counterparty",
                            Reason::new(
                                ReasonCode::CounterpartyDenied,
                                "counterparty is explicitly denied",
                            ),
                        ),
                        action_hash,
                        budget_date,
                    ));
                }
                if !policy.counterparty_allowlist.is_empty()
                    && !identifiers
                        .iter()
                        .any(|id| policy.counterparty_allowlist.contains(id))
                {
                    return Ok(self.done(
                        p.deny(
                            "counterparty",
                            Reason::new(
                                ReasonCode::CounterpartyDenied,
                                "counterparty not in allowlist",
                            ),
                        ),
                        action_hash,
                        budget_date,
                    ));
                }
                p.pass("counterparty");
            }
            None => p.skip("counterparty"),
        }

        // Stage 12: budget reservation.
        let cap = policy.budgets.daily_cap.or(self.defaults.default_daily_cap);
        let mut budget_reserved = false;
        match cap {
            None => p.skip("budget"),
            Some(cap) => {
                let claim = gate.claim(ctx.org_id, ctx.uapk_id, budget_date, cap).await?;
                match claim.count {
                    None => {
                        return Ok(Evaluation {
                            decision: p.deny(
                                "budget",
                                Reason::with_details(
                                    ReasonCode::BudgetExceeded,
                                    format!("daily budget of {cap} exhausted"),
                                    serde_json::json!({ "daily_cap": cap }),
                                ),
                            ),
                            action_hash,
                            override_approval_id: None,
                            budget_reserved: false,
                            budget_date,
                        });
                    }
                    Some(count) => {
                        budget_reserved = claim.reserved;
                        let escalate_percent = policy
                            .budgets
                            .escalate_percent
                            .unwrap_or(self.defaults.escalate_percent);
                        #[allow(clippy::cast_precision_loss)]
                        if count as f64 / cap as f64 >= escalate_percent {
                            p.escalate(
                                "budget",
                                Reason::with_details(
                                    ReasonCode::BudgetNearLimit,
                                    format!("daily budget nearly exhausted ({count}/{cap})"),
                                    serde_json::json!({ "count": count, "daily_cap": cap }),
                                ),
                            );
                        } else {
                            p.pass("budget");
                        }
                    }
                }
            }
        }

        let override_approval_id = p.override_approval_id;
        let decision = p.finish();
        debug!(
            org_id = ctx.org_id,
            uapk_id = ctx.uapk_id,
            agent_id = ctx.agent_id,
            decision = ?decision.kind,
            "policy evaluated"
        );
        Ok(Evaluation {
            decision,
            action_hash,
            override_approval_id,
            budget_reserved,
            budget_date,
        })
    }

    fn done(&self, decision: Decision, action_hash: String, budget_date: NaiveDate) -> Evaluation {
        Evaluation {
            decision,
            action_hash,
            override_approval_id: None,
            budget_reserved: false,
            budget_date,
        }
    }

    /// Stage 3 body: verify the override token and its approval binding.
    /// Returns the approval id on success, or the deny reason.
    async fn precheck_override(
        &self,
        ctx: &PolicyContext<'_>,
        token: &str,
        action_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Result<Uuid, Reason>, PolicyError> {
        let claims = match apg_token::verify_override(&self.keys, token, now) {
            Ok(claims) => claims,
            Err(TokenError::Expired) => {
                return Ok(Err(Reason::new(
                    ReasonCode::OverrideTokenExpired,
                    "override token expired",
                )));
            }
            Err(err) => {
                return Ok(Err(Reason::new(
                    ReasonCode::OverrideTokenInvalid,
                    format!("override token rejected: {err}"),
                )));
            }
        };

        if claims.action_hash != action_hash {
            return Ok(Err(Reason::new(
                ReasonCode::OverrideTokenActionMismatch,
                "override token was issued for a different action",
            )));
        }

        let Some(approval) = self.approvals.find_approval(claims.approval_id).await? else {
            return Ok(Err(Reason::new(
                ReasonCode::OverrideTokenInvalid,
                "override token references an unknown approval",
            )));
        };

        if approval.org_id != ctx.org_id
            || approval.uapk_id != ctx.uapk_id
            || approval.agent_id != ctx.agent_id
        {
            return Ok(Err(Reason::new(
                ReasonCode::OverrideTokenWrongIdentity,
                "approval belongs to a different identity",
            )));
        }
        if approval.action_hash != action_hash {
            return Ok(Err(Reason::new(
                ReasonCode::OverrideTokenActionMismatch,
                "approval covers a different action",
            )));
        }
        if approval.consumed_at.is_some() {
            return Ok(Err(Reason::new(
                ReasonCode::OverrideTokenAlreadyUsed,
                "approval was already consumed",
            )));
        }
        if approval.status != apg_core::ApprovalStatus::Approved {
            return Ok(Err(Reason::new(
                ReasonCode::OverrideTokenInvalid,
                format!("approval is {:?}, not APPROVED", approval.status),
            )));
        }
        if now >= approval.expires_at {
            return Ok(Err(Reason::new(
                ReasonCode::OverrideTokenExpired,
                "approval expired",
            )));
        }
        Ok(Ok(approval.approval_id))
    }
}

fn counterparty_identifiers(cp: &Counterparty) -> Vec<String> {
    [&cp.id, &cp.domain, &cp.email, &cp.name]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
}
