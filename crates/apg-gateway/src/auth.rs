// SPDX-License-Identifier: MIT OR Apache-2.0
//! Authentication seam and explicit role checks.
//!
//! Authentication itself is an external collaborator; the gateway consumes a
//! fully materialised `(principal, org_id, role)` tuple. A static key-table
//! implementation ships for tests and single-node deployments.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Caller role, from least to most privileged service-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Autonomous agent: may call evaluate/execute only.
    Agent,
    /// Read-only access to approvals, records, and exports.
    Viewer,
    /// May decide approvals, plus everything a viewer can.
    Operator,
    /// Full access.
    Admin,
}

impl Role {
    /// Whether this role satisfies `required`.
    #[must_use]
    pub fn permits(self, required: Role) -> bool {
        match required {
            Role::Agent => matches!(self, Role::Agent | Role::Admin),
            Role::Viewer => matches!(self, Role::Viewer | Role::Operator | Role::Admin),
            Role::Operator => matches!(self, Role::Operator | Role::Admin),
            Role::Admin => matches!(self, Role::Admin),
        }
    }
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable principal identifier.
    pub principal: String,
    /// Organisation the credential is scoped to.
    pub org_id: String,
    /// Granted role.
    pub role: Role,
}

/// Credential verification seam.
pub trait Authenticator: Send + Sync {
    /// Resolve an API key to a principal, or `None` for unknown keys.
    fn authenticate(&self, api_key: &str) -> Option<Principal>;
}

/// In-memory key table.
#[derive(Default)]
pub struct StaticAuthenticator {
    keys: HashMap<String, Principal>,
}

/// One key-table entry as configured (e.g. via `GATEWAY_API_KEYS`).
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyEntry {
    /// The API key value.
    pub key: String,
    /// Principal the key authenticates as.
    pub principal: String,
    /// Organisation scope.
    pub org_id: String,
    /// Granted role.
    pub role: Role,
}

impl StaticAuthenticator {
    /// Build from configured entries.
    #[must_use]
    pub fn from_entries(entries: Vec<ApiKeyEntry>) -> Self {
        let keys = entries
            .into_iter()
            .map(|e| {
                (
                    e.key,
                    Principal {
                        principal: e.principal,
                        org_id: e.org_id,
                        role: e.role,
                    },
                )
            })
            .collect();
        Self { keys }
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, api_key: &str) -> Option<Principal> {
        self.keys.get(api_key).cloned()
    }
}

/// Pull the API key from `Authorization: Bearer …` or `X-API-Key`.
#[must_use]
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("authorization") {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn table() -> StaticAuthenticator {
        StaticAuthenticator::from_entries(vec![ApiKeyEntry {
            key: "agent-key".into(),
            principal: "agent-1".into(),
            org_id: "org-1".into(),
            role: Role::Agent,
        }])
    }

    #[test]
    fn known_key_resolves() {
        let principal = table().authenticate("agent-key").unwrap();
        assert_eq!(principal.org_id, "org-1");
        assert_eq!(principal.role, Role::Agent);
    }

    #[test]
    fn unknown_key_is_none() {
        assert!(table().authenticate("nope").is_none());
    }

    #[test]
    fn role_lattice() {
        assert!(Role::Admin.permits(Role::Agent));
        assert!(Role::Admin.permits(Role::Operator));
        assert!(Role::Operator.permits(Role::Viewer));
        assert!(!Role::Viewer.permits(Role::Operator));
        assert!(!Role::Agent.permits(Role::Viewer));
        assert!(!Role::Viewer.permits(Role::Agent));
    }

    #[test]
    fn bearer_and_header_keys_are_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("abc"));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("xyz"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("xyz"));

        assert!(extract_api_key(&HeaderMap::new()).is_none());
    }
}
