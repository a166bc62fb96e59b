// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! apg-gateway
#![deny(unsafe_code)]

/// HTTP handlers and the error envelope.
pub mod api;
/// Authentication seam and role checks.
pub mod auth;
/// Request middleware: ids, logging, body caps, CORS.
pub mod middleware;
/// Gateway orchestration.
pub mod service;

pub use auth::{ApiKeyEntry, Authenticator, Principal, Role, StaticAuthenticator};
pub use service::{Gateway, GatewayError};

use apg_ratelimit::KeyedRateLimiter;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::sync::Arc;

/// Shared state behind every handler.
pub struct AppState {
    /// The assembled gateway service.
    pub gateway: Arc<Gateway>,
    /// Credential verification.
    pub auth: Arc<dyn Authenticator>,
    /// Request quotas.
    pub limiter: Arc<KeyedRateLimiter>,
    /// Request body ceiling.
    pub max_body_bytes: usize,
    /// CORS origins.
    pub cors_origins: Vec<String>,
}

/// Build the Axum router with all gateway routes and middleware.
pub fn build_app(state: Arc<AppState>) -> Router {
    let max_body_bytes = state.max_body_bytes;
    let cors = middleware::cors_layer(&state.cors_origins);

    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/readyz", get(api::readyz))
        .route("/api/v1/gateway/evaluate", post(api::evaluate))
        .route("/api/v1/gateway/execute", post(api::execute))
        .route("/api/v1/orgs/{org_id}/approvals", get(api::list_approvals))
        .route(
            "/api/v1/orgs/{org_id}/approvals/{approval_id}/approve",
            post(api::approve),
        )
        .route(
            "/api/v1/orgs/{org_id}/approvals/{approval_id}/deny",
            post(api::deny),
        )
        .route(
            "/api/v1/orgs/{org_id}/interaction-records",
            get(api::list_records),
        )
        .route(
            "/api/v1/orgs/{org_id}/logs/verify-chain",
            get(api::verify_chain),
        )
        .route("/api/v1/orgs/{org_id}/audit/export", post(api::export_audit))
        .layer(axum::middleware::from_fn(move |req, next| {
            middleware::body_cap(req, next, max_body_bytes)
        }))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(axum::middleware::from_fn(middleware::request_logger))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(cors)
        .with_state(state)
}
