// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared end-to-end fixture: a fully wired gateway over the in-memory
//! store, driven through the router with `tower::ServiceExt::oneshot`.
#![allow(dead_code)]

use apg_approval::ApprovalService;
use apg_audit::AuditChain;
use apg_connector::{ConnectorFactory, ConnectorSettings, GuardSettings, Resolver, build_client};
use apg_core::{Manifest, ManifestContent, ManifestStatus, ToolConfig};
use apg_gateway::{ApiKeyEntry, AppState, Gateway, Role, StaticAuthenticator, build_app};
use apg_keys::KeyManager;
use apg_manifest::ManifestResolver;
use apg_policy::{EngineDefaults, PolicyEngine};
use apg_ratelimit::{KeyedRateLimiter, RouteQuota};
use apg_store::{ManifestStore, MemoryStore};
use apg_vault::Vault;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use base64::Engine as _;
use http_body_util::BodyExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub const AGENT_KEY: &str = "agent-key";
pub const OPERATOR_KEY: &str = "operator-key";
pub const VIEWER_KEY: &str = "viewer-key";
pub const OTHER_ORG_KEY: &str = "other-org-key";

pub struct Harness {
    pub app: Router,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<Gateway>,
    pub keys: Arc<KeyManager>,
}

pub struct HarnessOptions {
    pub manifests: Vec<Manifest>,
    pub resolver: Option<Arc<dyn Resolver>>,
    pub limiter: Option<KeyedRateLimiter>,
    pub max_body_bytes: usize,
    pub default_daily_budget: Option<u64>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            manifests: Vec::new(),
            resolver: None,
            limiter: None,
            max_body_bytes: 1024 * 1024,
            default_daily_budget: None,
        }
    }
}

pub fn manifest(org: &str, uapk: &str, version: u32, status: ManifestStatus, policy: serde_json::Value, tools: Vec<(&str, ToolConfig)>) -> Manifest {
    let tools: BTreeMap<String, ToolConfig> = tools
        .into_iter()
        .map(|(name, cfg)| (name.to_string(), cfg))
        .collect();
    Manifest {
        org_id: org.into(),
        uapk_id: uapk.into(),
        version,
        status,
        content: ManifestContent { policy, tools },
        content_hash: None,
    }
}

pub async fn harness(options: HarnessOptions) -> Harness {
    let keys = Arc::new(KeyManager::generate());
    let store = Arc::new(MemoryStore::new());
    for m in options.manifests {
        store.put_manifest(m).await.unwrap();
    }

    let resolver = ManifestResolver::new(
        Arc::clone(&store) as Arc<dyn ManifestStore>,
        Duration::ZERO,
    );
    let engine = PolicyEngine::new(
        Arc::clone(&keys),
        Arc::clone(&store) as _,
        EngineDefaults {
            default_daily_cap: options.default_daily_budget,
            escalate_percent: apg_policy::DEFAULT_ESCALATE_PERCENT,
        },
    );
    let approvals = ApprovalService::new(
        Arc::clone(&store) as _,
        Arc::clone(&keys),
        chrono::Duration::hours(24),
        apg_token::DEFAULT_OVERRIDE_TTL,
    );
    let audit = AuditChain::new(Arc::clone(&store) as _, Arc::clone(&keys));

    let client = build_client(Duration::from_secs(2)).unwrap();
    let settings = ConnectorSettings {
        timeout: Duration::from_secs(2),
        max_response_bytes: 64 * 1024,
        guard: GuardSettings {
            global_allowed_domains: vec!["example.com".into()],
            allow_private_networks: false,
        },
    };
    let mut connectors = ConnectorFactory::new(client, settings);
    if let Some(resolver) = options.resolver {
        connectors = connectors.with_resolver(resolver);
    }

    let vault_key =
        base64::engine::general_purpose::STANDARD.encode([11u8; 32]);
    let vault = Vault::new(&vault_key, Arc::clone(&store) as _).unwrap();

    let gateway = Arc::new(Gateway::new(
        Arc::clone(&store),
        resolver,
        engine,
        approvals,
        audit,
        connectors,
        vault,
        Duration::from_secs(5),
    ));

    let auth = StaticAuthenticator::from_entries(vec![
        ApiKeyEntry {
            key: AGENT_KEY.into(),
            principal: "agent-1".into(),
            org_id: "org-1".into(),
            role: Role::Agent,
        },
        ApiKeyEntry {
            key: OPERATOR_KEY.into(),
            principal: "operator-1".into(),
            org_id: "org-1".into(),
            role: Role::Operator,
        },
        ApiKeyEntry {
            key: VIEWER_KEY.into(),
            principal: "viewer-1".into(),
            org_id: "org-1".into(),
            role: Role::Viewer,
        },
        ApiKeyEntry {
            key: OTHER_ORG_KEY.into(),
            principal: "agent-9".into(),
            org_id: "org-9".into(),
            role: Role::Agent,
        },
    ]);

    let limiter = options.limiter.unwrap_or_else(|| {
        KeyedRateLimiter::new(HashMap::new(), RouteQuota::per_minute(10_000))
    });

    let state = Arc::new(AppState {
        gateway: Arc::clone(&gateway),
        auth: Arc::new(auth),
        limiter: Arc::new(limiter),
        max_body_bytes: options.max_body_bytes,
        cors_origins: Vec::new(),
    });

    Harness {
        app: build_app(state),
        store,
        gateway,
        keys,
    }
}

pub async fn send(
    app: &Router,
    method: &str,
    path: &str,
    api_key: Option<&str>,
    body: Option<serde_json::Value>,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(key) = api_key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

pub async fn json_body(resp: Response<Body>) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn post_json(
    app: &Router,
    path: &str,
    api_key: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let resp = send(app, "POST", path, Some(api_key), Some(body)).await;
    let status = resp.status();
    (status, json_body(resp).await)
}

pub async fn get_json(
    app: &Router,
    path: &str,
    api_key: &str,
) -> (StatusCode, serde_json::Value) {
    let resp = send(app, "GET", path, Some(api_key), None).await;
    let status = resp.status();
    (status, json_body(resp).await)
}

pub fn email_request() -> serde_json::Value {
    serde_json::json!({
        "uapk_id": "notifier",
        "agent_id": "agent-1",
        "action": {
            "type": "email",
            "tool": "send_email",
            "params": {"to": "u@x.com"},
        },
    })
}

pub fn notifier_manifest() -> Manifest {
    manifest(
        "org-1",
        "notifier",
        1,
        ManifestStatus::Active,
        serde_json::json!({
            "allowed_tools": ["send_email"],
            "budgets": {"daily_cap": 100},
        }),
        vec![(
            "send_email",
            ToolConfig::mock(serde_json::json!({"queued": true})),
        )],
    )
}
