// SPDX-License-Identifier: MIT OR Apache-2.0
//! The http and webhook connectors: templated outbound calls under the URL
//! guard, with streamed, size-capped response handling.

use crate::guard::{Resolver, recheck, validate_url};
use crate::{ConnectorSettings, Invocation, ToolConnector};
use apg_core::{ExecutionResult, ToolConfig};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Method;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const SECRET_SCHEME: &str = "secret://";

/// Templated HTTP connector: params may fill `{placeholders}` in the URL;
/// leftovers become the JSON body (or query parameters for GET).
pub struct HttpConnector {
    client: reqwest::Client,
    settings: ConnectorSettings,
    resolver: Arc<dyn Resolver>,
    config: ToolConfig,
}

impl HttpConnector {
    /// Build a connector for one tool.
    pub fn new(
        client: reqwest::Client,
        settings: ConnectorSettings,
        resolver: Arc<dyn Resolver>,
        config: ToolConfig,
    ) -> Self {
        Self {
            client,
            settings,
            resolver,
            config,
        }
    }
}

#[async_trait]
impl ToolConnector for HttpConnector {
    async fn execute(&self, invocation: Invocation) -> ExecutionResult {
        let start = Instant::now();
        let Some(template) = self.config.url.as_deref() else {
            return failure("CONNECTOR_FAILED", "tool has no url configured", start);
        };
        let (url, used) = fill_template(template, &invocation.params);
        let method = self
            .config
            .method
            .as_deref()
            .and_then(|m| m.parse::<Method>().ok())
            .unwrap_or(Method::POST);

        let leftovers: serde_json::Map<String, Value> = invocation
            .params
            .iter()
            .filter(|(k, _)| !used.contains(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let body = if method == Method::GET {
            Payload::Query(leftovers)
        } else {
            Payload::Json(Value::Object(leftovers))
        };

        dispatch(
            &self.client,
            &self.settings,
            self.resolver.as_ref(),
            &self.config,
            &invocation,
            method,
            &url,
            body,
            start,
        )
        .await
    }
}

/// Webhook connector: one URL, POST, the params as the JSON body.
pub struct WebhookConnector {
    client: reqwest::Client,
    settings: ConnectorSettings,
    resolver: Arc<dyn Resolver>,
    config: ToolConfig,
}

impl WebhookConnector {
    /// Build a connector for one tool.
    pub fn new(
        client: reqwest::Client,
        settings: ConnectorSettings,
        resolver: Arc<dyn Resolver>,
        config: ToolConfig,
    ) -> Self {
        Self {
            client,
            settings,
            resolver,
            config,
        }
    }
}

#[async_trait]
impl ToolConnector for WebhookConnector {
    async fn execute(&self, invocation: Invocation) -> ExecutionResult {
        let start = Instant::now();
        let Some(url) = self.config.url.clone() else {
            return failure("CONNECTOR_FAILED", "webhook has no url configured", start);
        };
        let body = Payload::Json(Value::Object(invocation.params.clone()));
        dispatch(
            &self.client,
            &self.settings,
            self.resolver.as_ref(),
            &self.config,
            &invocation,
            Method::POST,
            &url,
            body,
            start,
        )
        .await
    }
}

enum Payload {
    Json(Value),
    Query(serde_json::Map<String, Value>),
}

/// Substitute `{name}` placeholders from params; returns the rendered URL
/// and the names that were consumed.
fn fill_template(
    template: &str,
    params: &serde_json::Map<String, Value>,
) -> (String, HashSet<String>) {
    let mut url = template.to_string();
    let mut used = HashSet::new();
    for (key, value) in params {
        let placeholder = format!("{{{key}}}");
        if url.contains(&placeholder) {
            url = url.replace(&placeholder, &value_as_str(value));
            used.insert(key.clone());
        }
    }
    (url, used)
}

fn value_as_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn failure(code: &str, message: impl Into<String>, start: Instant) -> ExecutionResult {
    ExecutionResult::failure(code, message, elapsed_ms(start))
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Shared send path for http and webhook: guard, header assembly, dispatch,
/// and capped streaming of the response body.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    client: &reqwest::Client,
    settings: &ConnectorSettings,
    resolver: &dyn Resolver,
    config: &ToolConfig,
    invocation: &Invocation,
    method: Method,
    url: &str,
    payload: Payload,
    start: Instant,
) -> ExecutionResult {
    let validated = match validate_url(url, &config.allowed_domains, &settings.guard, resolver).await
    {
        Ok(v) => v,
        Err(violation) => return failure(violation.code(), violation.to_string(), start),
    };

    let timeout = config
        .timeout_ms
        .map_or(settings.timeout, Duration::from_millis);
    let max_bytes = config
        .max_response_bytes
        .unwrap_or(settings.max_response_bytes);

    let mut request = client
        .request(method, validated.url.clone())
        .timeout(timeout);
    for (name, value) in &config.headers {
        let value = match resolve_header(value, invocation) {
            Ok(v) => v,
            Err(missing) => {
                return failure(
                    "CONNECTOR_FAILED",
                    format!("unresolved secret reference '{missing}'"),
                    start,
                );
            }
        };
        request = request.header(name.as_str(), value);
    }
    match payload {
        Payload::Json(body) => request = request.json(&body),
        Payload::Query(params) => {
            let pairs: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| (k.clone(), value_as_str(v)))
                .collect();
            request = request.query(&pairs);
        }
    }

    // Anti-rebinding: the address set must be the same one the guard saw.
    if let Err(violation) = recheck(&validated, resolver).await {
        return failure(violation.code(), violation.to_string(), start);
    }

    debug!(host = %validated.host, "dispatching tool call");
    let response = match tokio::time::timeout(timeout, request.send()).await {
        Err(_) => return failure("CONNECTOR_TIMEOUT", "tool call timed out", start),
        Ok(Err(err)) if err.is_timeout() => {
            return failure("CONNECTOR_TIMEOUT", "tool call timed out", start);
        }
        Ok(Err(err)) => {
            return failure("CONNECTOR_FAILED", format!("request failed: {err}"), start);
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    loop {
        let chunk = match tokio::time::timeout(timeout, stream.next()).await {
            Err(_) => return failure("CONNECTOR_TIMEOUT", "response read timed out", start),
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                return failure("CONNECTOR_FAILED", format!("read failed: {err}"), start);
            }
            Ok(Some(Ok(chunk))) => chunk,
        };
        if (body.len() + chunk.len()) as u64 > max_bytes {
            return failure(
                "RESPONSE_TOO_LARGE",
                format!("response exceeded {max_bytes} bytes"),
                start,
            );
        }
        body.extend_from_slice(&chunk);
    }

    let data: Value = serde_json::from_slice(&body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));
    let result_hash = apg_canon::hash_value(&data)
        .map(|d| apg_canon::to_hex(&d))
        .ok();

    if status.is_success() {
        ExecutionResult {
            success: true,
            data: Some(data),
            error: None,
            result_hash,
            status_code: Some(status.as_u16()),
            duration_ms: elapsed_ms(start),
        }
    } else {
        ExecutionResult {
            success: false,
            data: Some(data),
            error: Some(apg_core::ExecutionError {
                code: "CONNECTOR_FAILED".into(),
                message: format!("upstream returned {status}"),
            }),
            result_hash,
            status_code: Some(status.as_u16()),
            duration_ms: elapsed_ms(start),
        }
    }
}

/// Header values may reference vault secrets as `secret://NAME`.
fn resolve_header(value: &str, invocation: &Invocation) -> Result<String, String> {
    if let Some(name) = value.strip_prefix(SECRET_SCHEME) {
        return invocation
            .secrets
            .get(name)
            .cloned()
            .ok_or_else(|| name.to_string());
    }
    Ok(value.to_string())
}
