// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transport-level behaviour: auth, rate limits, body caps, health, export.

mod common;

use apg_ratelimit::{KeyedRateLimiter, RouteQuota};
use axum::http::StatusCode;
use common::{
    AGENT_KEY, HarnessOptions, OPERATOR_KEY, OTHER_ORG_KEY, VIEWER_KEY, email_request, get_json,
    harness, json_body, notifier_manifest, post_json, send,
};
use http_body_util::BodyExt;
use std::collections::HashMap;
use tower::ServiceExt;

#[tokio::test]
async fn missing_key_is_unauthenticated() {
    let h = harness(HarnessOptions::default()).await;
    let resp = send(
        &h.app,
        "POST",
        "/api/v1/gateway/execute",
        None,
        Some(email_request()),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(resp).await;
    assert_eq!(body["error"]["code"], "UNAUTHENTICATED");
}

#[tokio::test]
async fn agent_cannot_use_operator_endpoints() {
    let h = harness(HarnessOptions::default()).await;
    let (status, body) = get_json(&h.app, "/api/v1/orgs/org-1/approvals", AGENT_KEY).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "UNAUTHORISED");
}

#[tokio::test]
async fn cross_org_access_is_refused() {
    let h = harness(HarnessOptions::default()).await;
    let (status, body) = get_json(
        &h.app,
        "/api/v1/orgs/org-1/interaction-records",
        OTHER_ORG_KEY,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "UNAUTHORISED");
}

#[tokio::test]
async fn over_quota_returns_429_with_retry_after() {
    let limiter = KeyedRateLimiter::new(HashMap::new(), RouteQuota::per_minute(2));
    let h = harness(HarnessOptions {
        manifests: vec![notifier_manifest()],
        limiter: Some(limiter),
        ..HarnessOptions::default()
    })
    .await;

    for _ in 0..2 {
        let (status, _) =
            post_json(&h.app, "/api/v1/gateway/execute", AGENT_KEY, email_request()).await;
        assert_eq!(status, StatusCode::OK);
    }

    let resp = send(
        &h.app,
        "POST",
        "/api/v1/gateway/execute",
        Some(AGENT_KEY),
        Some(email_request()),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap();
    assert!(retry_after >= 1);
    let body = json_body(resp).await;
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn oversized_body_is_413_before_parsing() {
    let h = harness(HarnessOptions {
        max_body_bytes: 512,
        ..HarnessOptions::default()
    })
    .await;

    let mut request = email_request();
    request["action"]["params"]["padding"] = serde_json::json!("x".repeat(2048));
    let resp = send(
        &h.app,
        "POST",
        "/api/v1/gateway/execute",
        Some(AGENT_KEY),
        Some(request),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = json_body(resp).await;
    assert_eq!(body["error"]["code"], "PAYLOAD_TOO_LARGE");
}

#[tokio::test]
async fn malformed_json_is_400() {
    let h = harness(HarnessOptions::default()).await;
    let resp = h
        .app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/api/v1/gateway/execute")
                .header("authorization", format!("Bearer {AGENT_KEY}"))
                .header("content-type", "application/json")
                .body(axum::body::Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = json_body(resp).await;
    assert_eq!(body["error"]["code"], "MALFORMED_REQUEST");
}

#[tokio::test]
async fn health_and_readiness() {
    let h = harness(HarnessOptions::default()).await;

    let resp = send(&h.app, "GET", "/healthz", None, None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["status"], "ok");

    let resp = send(&h.app, "GET", "/readyz", None, None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["database"], true);
}

#[tokio::test]
async fn requests_carry_an_x_request_id() {
    let h = harness(HarnessOptions::default()).await;
    let resp = send(&h.app, "GET", "/healthz", None, None).await;
    let id = resp.headers().get("x-request-id").unwrap().to_str().unwrap();
    assert!(id.parse::<uuid::Uuid>().is_ok());
}

#[tokio::test]
async fn export_returns_a_gzip_bundle() {
    let h = harness(HarnessOptions {
        manifests: vec![notifier_manifest()],
        ..HarnessOptions::default()
    })
    .await;
    post_json(&h.app, "/api/v1/gateway/execute", AGENT_KEY, email_request()).await;

    let resp = send(
        &h.app,
        "POST",
        "/api/v1/orgs/org-1/audit/export",
        Some(VIEWER_KEY),
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "application/gzip"
    );
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    // Gzip magic.
    assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
}

#[tokio::test]
async fn deny_on_unknown_approval_is_404() {
    let h = harness(HarnessOptions::default()).await;
    let (status, body) = post_json(
        &h.app,
        &format!("/api/v1/orgs/org-1/approvals/{}/deny", uuid::Uuid::new_v4()),
        OPERATOR_KEY,
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn double_approve_is_409() {
    let h = harness(HarnessOptions {
        manifests: vec![common::manifest(
            "org-1",
            "payments",
            1,
            apg_core::ManifestStatus::Active,
            serde_json::json!({"approval_thresholds": {"amount": 10.0}}),
            vec![(
                "wire",
                apg_core::ToolConfig::mock(serde_json::json!({})),
            )],
        )],
        ..HarnessOptions::default()
    })
    .await;

    let request = serde_json::json!({
        "uapk_id": "payments",
        "agent_id": "agent-1",
        "action": {"type": "payment", "tool": "wire", "params": {}, "amount": 50.0},
    });
    let (_, body) = post_json(&h.app, "/api/v1/gateway/execute", AGENT_KEY, request).await;
    let approval_id = body["approval_id"].as_str().unwrap().to_string();
    let path = format!("/api/v1/orgs/org-1/approvals/{approval_id}/approve");

    let (status, _) = post_json(&h.app, &path, OPERATOR_KEY, serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = post_json(&h.app, &path, OPERATOR_KEY, serde_json::json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");
}
