// SPDX-License-Identifier: MIT OR Apache-2.0
//! DNS-rebinding protection exercised end to end: the webhook target's
//! resolution changes between validation and dispatch, and the gateway
//! records an executed-but-failed interaction.

mod common;

use apg_connector::Resolver;
use apg_core::{ManifestStatus, ToolConfig, ToolKind};
use async_trait::async_trait;
use axum::http::StatusCode;
use common::{AGENT_KEY, HarnessOptions, VIEWER_KEY, get_json, harness, manifest, post_json};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;

/// Resolver that answers from a script, one entry per call.
struct RebindingResolver {
    answers: Mutex<Vec<Vec<IpAddr>>>,
}

#[async_trait]
impl Resolver for RebindingResolver {
    async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<BTreeSet<IpAddr>> {
        let mut answers = self.answers.lock().unwrap();
        if answers.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "script exhausted",
            ));
        }
        Ok(answers.remove(0).into_iter().collect())
    }
}

fn webhook_tool() -> ToolConfig {
    ToolConfig {
        kind: ToolKind::Webhook,
        url: Some("https://example.com/hook".into()),
        method: None,
        headers: Default::default(),
        allowed_domains: vec!["example.com".into()],
        timeout_ms: None,
        max_response_bytes: None,
        secret_refs: Vec::new(),
        mock_response: None,
    }
}

#[tokio::test]
async fn dns_drift_fails_the_execution_but_not_the_decision() {
    let public: IpAddr = "203.0.113.7".parse().unwrap();
    let loopback: IpAddr = "127.0.0.1".parse().unwrap();
    let resolver = Arc::new(RebindingResolver {
        answers: Mutex::new(vec![vec![public], vec![loopback]]),
    });

    let h = harness(HarnessOptions {
        manifests: vec![manifest(
            "org-1",
            "hooks",
            1,
            ManifestStatus::Active,
            serde_json::json!({}),
            vec![("notify", webhook_tool())],
        )],
        resolver: Some(resolver),
        ..HarnessOptions::default()
    })
    .await;

    let request = serde_json::json!({
        "uapk_id": "hooks",
        "agent_id": "agent-1",
        "action": {"type": "notify", "tool": "notify", "params": {"event": "ping"}},
    });
    let (status, body) = post_json(&h.app, "/api/v1/gateway/execute", AGENT_KEY, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"], "ALLOW");
    assert_eq!(body["executed"], true);
    assert_eq!(body["result"]["success"], false);
    assert_eq!(body["result"]["error"]["code"], "SSRF_DNS_DRIFT");

    // The failed execution is on the chain, and the chain still verifies.
    let (_, records) = get_json(
        &h.app,
        "/api/v1/orgs/org-1/interaction-records?uapk_id=hooks",
        VIEWER_KEY,
    )
    .await;
    let record = &records["records"][0];
    assert_eq!(record["executed"], true);
    assert_eq!(record["result"]["success"], false);

    let (_, chains) = get_json(&h.app, "/api/v1/orgs/org-1/logs/verify-chain", VIEWER_KEY).await;
    assert_eq!(chains["chains"][0]["valid"], true);
}

#[tokio::test]
async fn private_resolution_is_blocked_outright() {
    let loopback: IpAddr = "127.0.0.1".parse().unwrap();
    let resolver = Arc::new(RebindingResolver {
        answers: Mutex::new(vec![vec![loopback]]),
    });

    let h = harness(HarnessOptions {
        manifests: vec![manifest(
            "org-1",
            "hooks",
            1,
            ManifestStatus::Active,
            serde_json::json!({}),
            vec![("notify", webhook_tool())],
        )],
        resolver: Some(resolver),
        ..HarnessOptions::default()
    })
    .await;

    let request = serde_json::json!({
        "uapk_id": "hooks",
        "agent_id": "agent-1",
        "action": {"type": "notify", "tool": "notify", "params": {}},
    });
    let (_, body) = post_json(&h.app, "/api/v1/gateway/execute", AGENT_KEY, request).await;
    assert_eq!(body["result"]["success"], false);
    assert_eq!(body["result"]["error"]["code"], "SSRF_BLOCKED");
}

#[tokio::test]
async fn unlisted_webhook_domain_is_refused() {
    let h = harness(HarnessOptions {
        manifests: vec![manifest(
            "org-1",
            "hooks",
            1,
            ManifestStatus::Active,
            serde_json::json!({}),
            vec![(
                "notify",
                ToolConfig {
                    allowed_domains: Vec::new(),
                    url: Some("https://intranet.internal/hook".into()),
                    ..webhook_tool()
                },
            )],
        )],
        ..HarnessOptions::default()
    })
    .await;

    let request = serde_json::json!({
        "uapk_id": "hooks",
        "agent_id": "agent-1",
        "action": {"type": "notify", "tool": "notify", "params": {}},
    });
    let (_, body) = post_json(&h.app, "/api/v1/gateway/execute", AGENT_KEY, request).await;
    assert_eq!(body["result"]["success"], false);
    assert_eq!(body["result"]["error"]["code"], "DOMAIN_NOT_ALLOWED");
}
