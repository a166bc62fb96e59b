// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! apg-config
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Deployment environment; governs which settings are mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Local development: missing keys are generated with a warning.
    Development,
    /// Pre-production: full validation.
    Staging,
    /// Production: full validation.
    Production,
}

impl Environment {
    /// Returns `true` for staging and production.
    #[must_use]
    pub fn requires_configured_keys(&self) -> bool {
        matches!(self, Self::Staging | Self::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        })
    }
}

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("failed to parse {name}: {reason}")]
    ParseError {
        /// Variable name.
        name: String,
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional setting is missing.
    MissingOptionalSetting {
        /// Variable name.
        name: String,
        /// Why it matters.
        hint: String,
    },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingOptionalSetting { name, hint } => {
                write!(f, "missing optional setting '{name}': {hint}")
            }
        }
    }
}

/// Placeholder values that are rejected wherever a real secret is required.
const PLACEHOLDER_SECRETS: &[&str] = &["changeme", "change-me", "placeholder", "secret", "default"];

/// Top-level runtime configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Deployment environment (`ENVIRONMENT`).
    pub environment: Environment,
    /// HMAC secret for the auth collaborator (`SECRET_KEY`).
    pub secret_key: Option<String>,
    /// Vault encryption key (`GATEWAY_FERNET_KEY`).
    pub vault_key: Option<String>,
    /// Ed25519 signing key material (`GATEWAY_ED25519_PRIVATE_KEY`).
    pub signing_key: Option<String>,
    /// Persistence target (`DATABASE_URL`).
    pub database_url: Option<String>,
    /// Global webhook domain allowlist (`GATEWAY_ALLOWED_WEBHOOK_DOMAINS`).
    pub allowed_webhook_domains: Vec<String>,
    /// Default daily cap when a manifest configures none
    /// (`GATEWAY_DEFAULT_DAILY_BUDGET`).
    pub default_daily_budget: Option<u64>,
    /// Approval lifetime in hours (`GATEWAY_APPROVAL_EXPIRY_HOURS`).
    pub approval_expiry_hours: i64,
    /// Connector timeout in seconds (`GATEWAY_CONNECTOR_TIMEOUT_SECONDS`).
    pub connector_timeout_seconds: u64,
    /// Request body ceiling (`GATEWAY_MAX_REQUEST_BYTES`).
    pub max_request_bytes: usize,
    /// CORS origins (`CORS_ORIGINS`).
    pub cors_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            secret_key: None,
            vault_key: None,
            signing_key: None,
            database_url: None,
            allowed_webhook_domains: Vec::new(),
            default_daily_budget: None,
            approval_expiry_hours: 24,
            connector_timeout_seconds: 30,
            max_request_bytes: 1024 * 1024,
            cors_origins: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load from the process environment and validate.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] on unparseable values or failed validation.
    pub fn from_env() -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary lookup. Tests inject maps here.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] on unparseable values or failed validation.
    pub fn from_lookup<F>(lookup: F) -> Result<(Self, Vec<ConfigWarning>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = match lookup("ENVIRONMENT").as_deref() {
            None | Some("development") => Environment::Development,
            Some("staging") => Environment::Staging,
            Some("production") => Environment::Production,
            Some(other) => {
                return Err(ConfigError::ParseError {
                    name: "ENVIRONMENT".into(),
                    reason: format!("unknown environment '{other}'"),
                });
            }
        };

        let config = Self {
            environment,
            secret_key: lookup("SECRET_KEY"),
            vault_key: lookup("GATEWAY_FERNET_KEY"),
            signing_key: lookup("GATEWAY_ED25519_PRIVATE_KEY"),
            database_url: lookup("DATABASE_URL"),
            allowed_webhook_domains: json_list(&lookup, "GATEWAY_ALLOWED_WEBHOOK_DOMAINS")?,
            default_daily_budget: parsed(&lookup, "GATEWAY_DEFAULT_DAILY_BUDGET")?,
            approval_expiry_hours: parsed(&lookup, "GATEWAY_APPROVAL_EXPIRY_HOURS")?.unwrap_or(24),
            connector_timeout_seconds: parsed(&lookup, "GATEWAY_CONNECTOR_TIMEOUT_SECONDS")?
                .unwrap_or(30),
            max_request_bytes: parsed(&lookup, "GATEWAY_MAX_REQUEST_BYTES")?
                .unwrap_or(1024 * 1024),
            cors_origins: json_list(&lookup, "CORS_ORIGINS")?,
        };

        let warnings = config.validate()?;
        Ok((config, warnings))
    }

    /// Validate the loaded settings for the configured environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] listing every problem found.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();

        if self.environment.requires_configured_keys() {
            match &self.secret_key {
                None => reasons.push("SECRET_KEY is required".into()),
                Some(key) if key.len() < 32 => {
                    reasons.push("SECRET_KEY must be at least 32 characters".into());
                }
                Some(key) if is_placeholder(key) => {
                    reasons.push("SECRET_KEY is a placeholder value".into());
                }
                Some(_) => {}
            }
            if self.vault_key.is_none() {
                reasons.push("GATEWAY_FERNET_KEY is required".into());
            }
            if self.signing_key.is_none() {
                reasons.push("GATEWAY_ED25519_PRIVATE_KEY is required".into());
            }
            if self.database_url.is_none() {
                reasons.push("DATABASE_URL is required".into());
            }
        } else {
            if self.signing_key.is_none() {
                warnings.push(ConfigWarning::MissingOptionalSetting {
                    name: "GATEWAY_ED25519_PRIVATE_KEY".into(),
                    hint: "a development keypair will be generated".into(),
                });
            }
            if self.vault_key.is_none() {
                warnings.push(ConfigWarning::MissingOptionalSetting {
                    name: "GATEWAY_FERNET_KEY".into(),
                    hint: "a development vault key will be generated".into(),
                });
            }
        }

        if reasons.is_empty() {
            Ok(warnings)
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }
}

fn is_placeholder(value: &str) -> bool {
    let lowered = value.to_ascii_lowercase();
    PLACEHOLDER_SECRETS.iter().any(|p| lowered.contains(p))
}

fn json_list<F>(lookup: &F, name: &str) -> Result<Vec<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
            name: name.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn parsed<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::ParseError {
                name: name.to_string(),
                reason: e.to_string(),
            }),
    }
}
