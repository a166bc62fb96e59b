// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use apg_approval::ApprovalService;
use apg_audit::AuditChain;
use apg_config::GatewayConfig;
use apg_connector::{ConnectorFactory, ConnectorSettings, GuardSettings, build_client};
use apg_core::Manifest;
use apg_gateway::{AppState, Gateway, StaticAuthenticator, build_app};
use apg_keys::KeyManager;
use apg_manifest::ManifestResolver;
use apg_policy::{EngineDefaults, PolicyEngine};
use apg_ratelimit::KeyedRateLimiter;
use apg_store::{ManifestStore, MemoryStore};
use apg_vault::Vault;
use base64::Engine as _;
use clap::Parser;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "apg-gateway", version, about = "AI agent policy gateway")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8090")]
    bind: String,

    /// Directory for development keys and local state.
    #[arg(long, default_value = ".agent-policy-gateway")]
    state_dir: PathBuf,

    /// Manifest fixture file (JSON array) loaded at startup.
    #[arg(long)]
    manifests: Option<PathBuf>,

    /// Enable request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("apg=debug,apg_gateway=debug,tower_http=info")
    } else {
        EnvFilter::new("apg=info,apg_gateway=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (config, warnings) = GatewayConfig::from_env().context("load configuration")?;
    for warning in &warnings {
        warn!("{warning}");
    }
    info!(environment = %config.environment, "starting gateway");

    let keys = Arc::new(
        KeyManager::bootstrap(
            config.signing_key.as_deref(),
            Some(&args.state_dir.join("dev_signing_key.pem")),
        )
        .context("load signing key")?,
    );

    let vault_key = match &config.vault_key {
        Some(key) => key.clone(),
        None => {
            // Development only; validation rejects this branch elsewhere.
            warn!("no vault key configured; generating an ephemeral development key");
            let mut bytes = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            base64::engine::general_purpose::STANDARD.encode(bytes)
        }
    };

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &args.manifests {
        load_manifests(&store, path).await?;
    }

    let resolver = ManifestResolver::new(
        Arc::clone(&store) as Arc<dyn ManifestStore>,
        ManifestResolver::DEFAULT_TTL,
    );
    let engine = PolicyEngine::new(
        Arc::clone(&keys),
        Arc::clone(&store) as _,
        EngineDefaults {
            default_daily_cap: config.default_daily_budget,
            escalate_percent: apg_policy::DEFAULT_ESCALATE_PERCENT,
        },
    );
    let approvals = ApprovalService::new(
        Arc::clone(&store) as _,
        Arc::clone(&keys),
        chrono::Duration::hours(config.approval_expiry_hours),
        apg_token::DEFAULT_OVERRIDE_TTL,
    );
    let audit = AuditChain::new(Arc::clone(&store) as _, Arc::clone(&keys));

    let connector_timeout = Duration::from_secs(config.connector_timeout_seconds);
    let client = build_client(connector_timeout).context("build outbound client")?;
    let connectors = ConnectorFactory::new(
        client,
        ConnectorSettings {
            timeout: connector_timeout,
            max_response_bytes: apg_connector::DEFAULT_MAX_RESPONSE_BYTES,
            guard: GuardSettings {
                global_allowed_domains: config.allowed_webhook_domains.clone(),
                allow_private_networks: false,
            },
        },
    );
    let vault = Vault::new(&vault_key, Arc::clone(&store) as _).context("open secrets vault")?;

    let gateway = Arc::new(Gateway::new(
        Arc::clone(&store),
        resolver,
        engine,
        approvals,
        audit,
        connectors,
        vault,
        connector_timeout + Duration::from_secs(5),
    ));

    let auth = Arc::new(load_api_keys()?);
    let state = Arc::new(AppState {
        gateway,
        auth,
        limiter: Arc::new(KeyedRateLimiter::with_gateway_defaults()),
        max_body_bytes: config.max_request_bytes,
        cors_origins: config.cors_origins.clone(),
    });
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "apg-gateway listening");

    axum::serve(listener, app).await.context("serve")
}

async fn load_manifests(store: &Arc<MemoryStore>, path: &PathBuf) -> Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read manifests {}", path.display()))?;
    let manifests: Vec<Manifest> =
        serde_json::from_str(&raw).with_context(|| format!("parse manifests {}", path.display()))?;
    let count = manifests.len();
    for manifest in manifests {
        store
            .put_manifest(manifest)
            .await
            .context("store manifest")?;
    }
    info!(count, "manifests loaded");
    Ok(())
}

/// API keys arrive as a JSON array in `GATEWAY_API_KEYS`:
/// `[{"key": "...", "principal": "...", "org_id": "...", "role": "agent"}]`.
fn load_api_keys() -> Result<StaticAuthenticator> {
    match std::env::var("GATEWAY_API_KEYS") {
        Err(_) => {
            warn!("GATEWAY_API_KEYS not set; every request will be unauthenticated");
            Ok(StaticAuthenticator::default())
        }
        Ok(raw) => {
            let entries = serde_json::from_str(&raw).context("parse GATEWAY_API_KEYS")?;
            Ok(StaticAuthenticator::from_entries(entries))
        }
    }
}
