// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! apg-connector
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod guard;
mod outbound;

pub use guard::{
    GuardSettings, GuardViolation, Resolver, SystemResolver, ValidatedUrl, domain_matches,
    ip_blocked, recheck, validate_url,
};
pub use outbound::{HttpConnector, WebhookConnector};

use apg_core::{ExecutionResult, ToolConfig, ToolKind};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default response body ceiling.
pub const DEFAULT_MAX_RESPONSE_BYTES: u64 = 1024 * 1024;

/// Connector-wide settings; per-tool config may tighten or override.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    /// Per-call timeout when the tool configures none.
    pub timeout: Duration,
    /// Response body ceiling when the tool configures none.
    pub max_response_bytes: u64,
    /// URL guard settings.
    pub guard: GuardSettings,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            guard: GuardSettings::default(),
        }
    }
}

/// One tool call: parameters plus the secrets resolved for this tool.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Action parameters.
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Plaintext secrets keyed by reference name, resolved at call time.
    pub secrets: BTreeMap<String, String>,
}

/// A tool executor. Implementations never error across this boundary —
/// every failure is an [`ExecutionResult`] with `success = false`.
#[async_trait]
pub trait ToolConnector: Send + Sync {
    /// Execute the tool call.
    async fn execute(&self, invocation: Invocation) -> ExecutionResult;
}

/// Deterministic in-process connector used by tests and dry wiring.
pub struct MockConnector {
    response: Option<serde_json::Value>,
}

impl MockConnector {
    /// Build with the configured canned response.
    #[must_use]
    pub fn new(response: Option<serde_json::Value>) -> Self {
        Self { response }
    }
}

#[async_trait]
impl ToolConnector for MockConnector {
    async fn execute(&self, _invocation: Invocation) -> ExecutionResult {
        let data = self
            .response
            .clone()
            .unwrap_or_else(|| serde_json::json!({"ok": true}));
        let result_hash = apg_canon::hash_value(&data)
            .map(|d| apg_canon::to_hex(&d))
            .ok();
        ExecutionResult {
            success: true,
            data: Some(data),
            error: None,
            result_hash,
            status_code: None,
            duration_ms: 0,
        }
    }
}

/// Builds connectors for configured tools over one shared HTTP client.
pub struct ConnectorFactory {
    client: reqwest::Client,
    settings: ConnectorSettings,
    resolver: Arc<dyn Resolver>,
}

impl ConnectorFactory {
    /// Build a factory with the system resolver.
    pub fn new(client: reqwest::Client, settings: ConnectorSettings) -> Self {
        Self {
            client,
            settings,
            resolver: Arc::new(SystemResolver),
        }
    }

    /// Replace the resolver. Tests use this to script DNS answers.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// The connector for one tool configuration.
    pub fn connector(&self, config: &ToolConfig) -> Box<dyn ToolConnector> {
        match config.kind {
            ToolKind::Mock => Box::new(MockConnector::new(config.mock_response.clone())),
            ToolKind::Http => Box::new(HttpConnector::new(
                self.client.clone(),
                self.settings.clone(),
                Arc::clone(&self.resolver),
                config.clone(),
            )),
            ToolKind::Webhook => Box::new(WebhookConnector::new(
                self.client.clone(),
                self.settings.clone(),
                Arc::clone(&self.resolver),
                config.clone(),
            )),
        }
    }
}

/// Build the shared outbound HTTP client: redirects off, ambient proxy
/// configuration ignored.
///
/// # Errors
///
/// Propagates client construction failure.
pub fn build_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .build()
}
