// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pipeline behaviour across the thirteen stages.

use apg_core::{
    Action, Approval, ApprovalStatus, Counterparty, DecisionKind, Manifest, ManifestContent,
    ManifestStatus, ReasonCode, ToolConfig,
};
use apg_manifest::{ResolvedManifest, resolve};
use apg_policy::{EngineDefaults, PeekGate, PolicyContext, PolicyEngine, ReservingGate};
use apg_store::{ApprovalStore, CounterStore, MemoryStore};
use apg_token::DEFAULT_OVERRIDE_TTL;
use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

fn manifest_with_policy(policy: serde_json::Value) -> ResolvedManifest {
    let mut tools = std::collections::BTreeMap::new();
    tools.insert(
        "send_email".to_string(),
        ToolConfig::mock(serde_json::json!({"queued": true})),
    );
    tools.insert(
        "wire".to_string(),
        ToolConfig::mock(serde_json::json!({"sent": true})),
    );
    resolve(Manifest {
        org_id: "org-1".into(),
        uapk_id: "notifier".into(),
        version: 1,
        status: ManifestStatus::Active,
        content: ManifestContent {
            policy,
            tools,
        },
        content_hash: None,
    })
}

fn action(v: serde_json::Value) -> Action {
    serde_json::from_value(v).unwrap()
}

fn email_action() -> Action {
    action(serde_json::json!({
        "type": "email", "tool": "send_email", "params": {"to": "u@x.com"},
    }))
}

struct Fixture {
    engine: PolicyEngine,
    store: Arc<MemoryStore>,
    keys: Arc<apg_keys::KeyManager>,
}

fn fixture() -> Fixture {
    fixture_with(EngineDefaults::default())
}

fn fixture_with(defaults: EngineDefaults) -> Fixture {
    let keys = Arc::new(apg_keys::KeyManager::generate());
    let store = Arc::new(MemoryStore::new());
    let engine = PolicyEngine::new(
        Arc::clone(&keys),
        Arc::clone(&store) as Arc<dyn ApprovalStore>,
        defaults,
    );
    Fixture { engine, store, keys }
}

fn ctx<'a>(
    action: &'a Action,
    manifest: Option<&'a ResolvedManifest>,
) -> PolicyContext<'a> {
    PolicyContext {
        org_id: "org-1",
        uapk_id: "notifier",
        agent_id: "agent-1",
        action,
        counterparty: None,
        capability_token: None,
        override_token: None,
        manifest,
    }
}

fn reason_codes(decision: &apg_core::Decision) -> Vec<ReasonCode> {
    decision.reasons.iter().map(|r| r.code).collect()
}

#[tokio::test]
async fn default_policy_allows() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({}));
    let a = email_action();
    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);

    let eval = f
        .engine
        .evaluate(&ctx(&a, Some(&manifest)), &gate, Utc::now())
        .await
        .unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Allow);
    assert!(eval.decision.reasons.is_empty());
    assert_eq!(eval.action_hash.len(), 64);
}

#[tokio::test]
async fn missing_manifest_denies() {
    let f = fixture();
    let a = email_action();
    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);

    let eval = f.engine.evaluate(&ctx(&a, None), &gate, Utc::now()).await.unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Deny);
    assert_eq!(reason_codes(&eval.decision), vec![ReasonCode::ManifestNotFound]);
}

#[tokio::test]
async fn denylist_beats_allowlist() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({
        "allowed_tools": ["send_email"],
        "denied_tools": ["send_email"],
    }));
    let a = email_action();
    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);

    let eval = f
        .engine
        .evaluate(&ctx(&a, Some(&manifest)), &gate, Utc::now())
        .await
        .unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Deny);
    assert_eq!(reason_codes(&eval.decision), vec![ReasonCode::ToolNotAllowed]);
}

#[tokio::test]
async fn unconfigured_tool_denies() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({}));
    let a = action(serde_json::json!({
        "type": "email", "tool": "mystery_tool", "params": {},
    }));
    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);

    let eval = f
        .engine
        .evaluate(&ctx(&a, Some(&manifest)), &gate, Utc::now())
        .await
        .unwrap();
    assert_eq!(reason_codes(&eval.decision), vec![ReasonCode::ToolNotConfigured]);
}

#[tokio::test]
async fn action_type_outside_allowlist_denies() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({
        "allowed_action_types": ["payment"],
    }));
    let a = email_action();
    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);

    let eval = f
        .engine
        .evaluate(&ctx(&a, Some(&manifest)), &gate, Utc::now())
        .await
        .unwrap();
    assert_eq!(reason_codes(&eval.decision), vec![ReasonCode::ActionTypeDenied]);
}

#[tokio::test]
async fn threshold_amount_escalates() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({
        "approval_thresholds": {"amount": 10000.0},
    }));
    let a = action(serde_json::json!({
        "type": "payment", "tool": "wire", "params": {}, "amount": 15000.0,
    }));
    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);

    let eval = f
        .engine
        .evaluate(&ctx(&a, Some(&manifest)), &gate, Utc::now())
        .await
        .unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Escalate);
    assert!(eval.decision.approval_required);
    assert_eq!(reason_codes(&eval.decision), vec![ReasonCode::ApprovalRequired]);
}

#[tokio::test]
async fn amount_cap_boundaries() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({
        "amount_caps": {"max_amount": 10000.0, "escalate_above": 5000.0},
    }));
    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);

    // Exactly at the hard cap: allowed (though above the soft cap, so it
    // escalates rather than denies).
    let at_max = action(serde_json::json!({
        "type": "payment", "tool": "wire", "params": {}, "amount": 10000.0,
    }));
    let eval = f
        .engine
        .evaluate(&ctx(&at_max, Some(&manifest)), &gate, Utc::now())
        .await
        .unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Escalate);

    // One unit above: denied.
    let over = action(serde_json::json!({
        "type": "payment", "tool": "wire", "params": {}, "amount": 10001.0,
    }));
    let eval = f
        .engine
        .evaluate(&ctx(&over, Some(&manifest)), &gate, Utc::now())
        .await
        .unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Deny);
    assert_eq!(reason_codes(&eval.decision), vec![ReasonCode::AmountCapExceeded]);

    // Exactly at the soft cap: escalated.
    let at_soft = action(serde_json::json!({
        "type": "payment", "tool": "wire", "params": {}, "amount": 5000.0,
    }));
    let eval = f
        .engine
        .evaluate(&ctx(&at_soft, Some(&manifest)), &gate, Utc::now())
        .await
        .unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Escalate);

    // Below both: allowed.
    let low = action(serde_json::json!({
        "type": "payment", "tool": "wire", "params": {}, "amount": 100.0,
    }));
    let eval = f
        .engine
        .evaluate(&ctx(&low, Some(&manifest)), &gate, Utc::now())
        .await
        .unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Allow);
}

#[tokio::test]
async fn amount_from_param_path() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({
        "amount_caps": {"max_amount": 100.0, "param_paths": ["invoice.total"]},
    }));
    let a = action(serde_json::json!({
        "type": "payment", "tool": "wire",
        "params": {"invoice": {"total": 250.0}},
    }));
    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);

    let eval = f
        .engine
        .evaluate(&ctx(&a, Some(&manifest)), &gate, Utc::now())
        .await
        .unwrap();
    assert_eq!(reason_codes(&eval.decision), vec![ReasonCode::AmountCapExceeded]);
}

#[tokio::test]
async fn jurisdiction_and_counterparty_rules() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({
        "allowed_jurisdictions": ["DE"],
        "counterparty": {"denylist": ["evil.com"]},
    }));
    let a = email_action();
    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);

    let allowed = Counterparty {
        domain: Some("acme.com".into()),
        jurisdiction: Some("DE".into()),
        ..Counterparty::default()
    };
    let mut c = ctx(&a, Some(&manifest));
    c.counterparty = Some(&allowed);
    let eval = f.engine.evaluate(&c, &gate, Utc::now()).await.unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Allow);

    let wrong_jurisdiction = Counterparty {
        jurisdiction: Some("US".into()),
        ..Counterparty::default()
    };
    let mut c = ctx(&a, Some(&manifest));
    c.counterparty = Some(&wrong_jurisdiction);
    let eval = f.engine.evaluate(&c, &gate, Utc::now()).await.unwrap();
    assert_eq!(reason_codes(&eval.decision), vec![ReasonCode::JurisdictionDenied]);

    let denied = Counterparty {
        domain: Some("evil.com".into()),
        jurisdiction: Some("DE".into()),
        ..Counterparty::default()
    };
    let mut c = ctx(&a, Some(&manifest));
    c.counterparty = Some(&denied);
    let eval = f.engine.evaluate(&c, &gate, Utc::now()).await.unwrap();
    assert_eq!(reason_codes(&eval.decision), vec![ReasonCode::CounterpartyDenied]);
}

#[tokio::test]
async fn budget_exhaustion_denies_and_near_limit_escalates() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({
        "budgets": {"daily_cap": 2},
    }));
    let a = email_action();
    let gate = ReservingGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);
    let now = Utc::now();

    // First reservation: 1/2 = 0.5 < 0.9, plain allow.
    let eval = f
        .engine
        .evaluate(&ctx(&a, Some(&manifest)), &gate, now)
        .await
        .unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Allow);
    assert!(eval.budget_reserved);

    // Second: 2/2 = 1.0 >= 0.9, escalates.
    let eval = f
        .engine
        .evaluate(&ctx(&a, Some(&manifest)), &gate, now)
        .await
        .unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Escalate);
    assert_eq!(reason_codes(&eval.decision), vec![ReasonCode::BudgetNearLimit]);

    // Third: cap exhausted.
    let eval = f
        .engine
        .evaluate(&ctx(&a, Some(&manifest)), &gate, now)
        .await
        .unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Deny);
    assert_eq!(reason_codes(&eval.decision), vec![ReasonCode::BudgetExceeded]);
    assert!(!eval.budget_reserved);
}

#[tokio::test]
async fn require_capability_denies_bare_requests() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({
        "require_capability_token": true,
    }));
    let a = email_action();
    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);

    let eval = f
        .engine
        .evaluate(&ctx(&a, Some(&manifest)), &gate, Utc::now())
        .await
        .unwrap();
    assert_eq!(reason_codes(&eval.decision), vec![ReasonCode::CapabilityRequired]);
}

#[tokio::test]
async fn capability_identity_mismatch_denies() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({}));
    let a = email_action();
    let now = Utc::now();
    let token = apg_token::issue_capability(
        &f.keys,
        &apg_token::CapabilitySpec {
            iss: "gateway".into(),
            sub: "someone-else".into(),
            org_id: "org-1".into(),
            uapk_id: "notifier".into(),
            allowed_action_types: vec![],
            allowed_tools: vec![],
            constraints: None,
            ttl: Duration::minutes(30),
        },
        now,
    );
    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);
    let mut c = ctx(&a, Some(&manifest));
    c.capability_token = Some(&token);

    let eval = f.engine.evaluate(&c, &gate, now).await.unwrap();
    assert_eq!(reason_codes(&eval.decision), vec![ReasonCode::CapabilityTokenInvalid]);
}

#[tokio::test]
async fn capability_tool_list_restricts() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({}));
    let a = email_action();
    let now = Utc::now();
    let token = apg_token::issue_capability(
        &f.keys,
        &apg_token::CapabilitySpec {
            iss: "gateway".into(),
            sub: "agent-1".into(),
            org_id: "org-1".into(),
            uapk_id: "notifier".into(),
            allowed_action_types: vec![],
            allowed_tools: vec!["wire".into()],
            constraints: None,
            ttl: Duration::minutes(30),
        },
        now,
    );
    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);
    let mut c = ctx(&a, Some(&manifest));
    c.capability_token = Some(&token);

    let eval = f.engine.evaluate(&c, &gate, now).await.unwrap();
    assert_eq!(reason_codes(&eval.decision), vec![ReasonCode::ToolNotAllowed]);
}

fn approved_approval(
    action: &Action,
    now: chrono::DateTime<Utc>,
) -> Approval {
    Approval {
        approval_id: Uuid::new_v4(),
        org_id: "org-1".into(),
        uapk_id: "notifier".into(),
        agent_id: "agent-1".into(),
        action: action.clone(),
        action_hash: apg_canon::action_hash_hex(action),
        status: ApprovalStatus::Approved,
        created_at: now,
        expires_at: now + Duration::hours(24),
        decided_at: Some(now),
        decided_by: Some("operator".into()),
        consumed_at: None,
        consumed_interaction_id: None,
        override_token_hash: None,
    }
}

#[tokio::test]
async fn override_converts_escalation_to_allow() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({
        "approval_thresholds": {"amount": 10000.0},
    }));
    let a = action(serde_json::json!({
        "type": "payment", "tool": "wire", "params": {}, "amount": 15000.0,
    }));
    let now = Utc::now();
    let approval = approved_approval(&a, now);
    let token = apg_token::issue_override(
        &f.keys,
        approval.approval_id,
        &approval.action_hash,
        DEFAULT_OVERRIDE_TTL,
        now,
    );
    f.store.insert_approval(approval.clone()).await.unwrap();

    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);
    let mut c = ctx(&a, Some(&manifest));
    c.override_token = Some(&token);

    let eval = f.engine.evaluate(&c, &gate, now).await.unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Allow);
    assert!(eval.decision.override_accepted);
    assert_eq!(eval.override_approval_id, Some(approval.approval_id));
    let codes = reason_codes(&eval.decision);
    assert!(codes.contains(&ReasonCode::ApprovalRequired));
    assert!(codes.contains(&ReasonCode::OverrideTokenAccepted));
}

#[tokio::test]
async fn override_cannot_clear_a_deny() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({
        "denied_tools": ["wire"],
    }));
    let a = action(serde_json::json!({
        "type": "payment", "tool": "wire", "params": {}, "amount": 15000.0,
    }));
    let now = Utc::now();
    let approval = approved_approval(&a, now);
    let token = apg_token::issue_override(
        &f.keys,
        approval.approval_id,
        &approval.action_hash,
        DEFAULT_OVERRIDE_TTL,
        now,
    );
    f.store.insert_approval(approval).await.unwrap();

    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);
    let mut c = ctx(&a, Some(&manifest));
    c.override_token = Some(&token);

    let eval = f.engine.evaluate(&c, &gate, now).await.unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Deny);
}

#[tokio::test]
async fn tampered_action_mismatches_override() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({
        "approval_thresholds": {"amount": 10000.0},
    }));
    let approved = action(serde_json::json!({
        "type": "payment", "tool": "wire", "params": {}, "amount": 15000.0,
    }));
    let now = Utc::now();
    let approval = approved_approval(&approved, now);
    let token = apg_token::issue_override(
        &f.keys,
        approval.approval_id,
        &approval.action_hash,
        DEFAULT_OVERRIDE_TTL,
        now,
    );
    f.store.insert_approval(approval).await.unwrap();

    let tampered = action(serde_json::json!({
        "type": "payment", "tool": "wire", "params": {}, "amount": 1000000.0,
    }));
    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);
    let mut c = ctx(&tampered, Some(&manifest));
    c.override_token = Some(&token);

    let eval = f.engine.evaluate(&c, &gate, now).await.unwrap();
    assert_eq!(eval.decision.kind, DecisionKind::Deny);
    assert_eq!(
        reason_codes(&eval.decision),
        vec![ReasonCode::OverrideTokenActionMismatch]
    );
}

#[tokio::test]
async fn consumed_approval_denies_reuse() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({
        "approval_thresholds": {"amount": 10000.0},
    }));
    let a = action(serde_json::json!({
        "type": "payment", "tool": "wire", "params": {}, "amount": 15000.0,
    }));
    let now = Utc::now();
    let mut approval = approved_approval(&a, now);
    approval.consumed_at = Some(now);
    approval.consumed_interaction_id = Some(Uuid::new_v4());
    let token = apg_token::issue_override(
        &f.keys,
        approval.approval_id,
        &approval.action_hash,
        DEFAULT_OVERRIDE_TTL,
        now,
    );
    f.store.insert_approval(approval).await.unwrap();

    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);
    let mut c = ctx(&a, Some(&manifest));
    c.override_token = Some(&token);

    let eval = f.engine.evaluate(&c, &gate, now).await.unwrap();
    assert_eq!(
        reason_codes(&eval.decision),
        vec![ReasonCode::OverrideTokenAlreadyUsed]
    );
}

#[tokio::test]
async fn wrong_agent_cannot_redeem_override() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({}));
    let a = action(serde_json::json!({
        "type": "payment", "tool": "wire", "params": {}, "amount": 15000.0,
    }));
    let now = Utc::now();
    let mut approval = approved_approval(&a, now);
    approval.agent_id = "someone-else".into();
    let token = apg_token::issue_override(
        &f.keys,
        approval.approval_id,
        &approval.action_hash,
        DEFAULT_OVERRIDE_TTL,
        now,
    );
    f.store.insert_approval(approval).await.unwrap();

    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);
    let mut c = ctx(&a, Some(&manifest));
    c.override_token = Some(&token);

    let eval = f.engine.evaluate(&c, &gate, now).await.unwrap();
    assert_eq!(
        reason_codes(&eval.decision),
        vec![ReasonCode::OverrideTokenWrongIdentity]
    );
}

#[tokio::test]
async fn trace_records_every_stage_on_allow() {
    let f = fixture();
    let manifest = manifest_with_policy(serde_json::json!({}));
    let a = email_action();
    let gate = PeekGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);

    let eval = f
        .engine
        .evaluate(&ctx(&a, Some(&manifest)), &gate, Utc::now())
        .await
        .unwrap();
    let stages: Vec<&str> = eval.decision.policy_trace.iter().map(|t| t.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec![
            "manifest",
            "capability_token",
            "override_token",
            "require_capability",
            "action_type",
            "tool_policy",
            "tool_configured",
            "approval_thresholds",
            "amount_caps",
            "jurisdiction",
            "counterparty",
            "budget",
        ]
    );
}

#[tokio::test]
async fn default_daily_cap_applies_when_manifest_is_silent() {
    let f = fixture_with(EngineDefaults {
        default_daily_cap: Some(1),
        escalate_percent: 2.0,
    });
    let manifest = manifest_with_policy(serde_json::json!({}));
    let a = email_action();
    let gate = ReservingGate::new(Arc::clone(&f.store) as Arc<dyn CounterStore>);
    let now = Utc::now();

    let first = f
        .engine
        .evaluate(&ctx(&a, Some(&manifest)), &gate, now)
        .await
        .unwrap();
    assert_eq!(first.decision.kind, DecisionKind::Allow);

    let second = f
        .engine
        .evaluate(&ctx(&a, Some(&manifest)), &gate, now)
        .await
        .unwrap();
    assert_eq!(reason_codes(&second.decision), vec![ReasonCode::BudgetExceeded]);
}
