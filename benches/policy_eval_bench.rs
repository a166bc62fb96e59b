// SPDX-License-Identifier: MIT OR Apache-2.0
//! Decision pipeline throughput over a representative manifest.

use apg_core::{Action, Manifest, ManifestContent, ManifestStatus, ToolConfig};
use apg_manifest::resolve;
use apg_policy::{EngineDefaults, PeekGate, PolicyContext, PolicyEngine};
use apg_store::MemoryStore;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

fn bench_policy_eval(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    let mut tools = std::collections::BTreeMap::new();
    tools.insert(
        "wire".to_string(),
        ToolConfig::mock(serde_json::json!({"sent": true})),
    );
    let manifest = resolve(Manifest {
        org_id: "org-1".into(),
        uapk_id: "payments".into(),
        version: 1,
        status: ManifestStatus::Active,
        content: ManifestContent {
            policy: serde_json::json!({
                "allowed_tools": ["wire"],
                "allowed_action_types": ["payment"],
                "amount_caps": {"max_amount": 100000.0, "escalate_above": 50000.0},
                "approval_thresholds": {"amount": 75000.0},
                "budgets": {"daily_cap": 10000},
            }),
            tools,
        },
        content_hash: None,
    });

    let store = Arc::new(MemoryStore::new());
    let engine = PolicyEngine::new(
        Arc::new(apg_keys::KeyManager::generate()),
        Arc::clone(&store) as _,
        EngineDefaults::default(),
    );
    let gate = PeekGate::new(Arc::clone(&store) as _);
    let action: Action = serde_json::from_value(serde_json::json!({
        "type": "payment", "tool": "wire", "params": {"memo": "invoice 42"},
        "amount": 1200.0, "currency": "EUR",
    }))
    .unwrap();

    c.bench_function("policy_eval_allow", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let ctx = PolicyContext {
                    org_id: "org-1",
                    uapk_id: "payments",
                    agent_id: "agent-1",
                    action: black_box(&action),
                    counterparty: None,
                    capability_token: None,
                    override_token: None,
                    manifest: Some(&manifest),
                };
                engine
                    .evaluate(&ctx, &gate, chrono::Utc::now())
                    .await
                    .unwrap()
            })
        })
    });
}

criterion_group!(benches, bench_policy_eval);
criterion_main!(benches);
