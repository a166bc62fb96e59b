// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP handlers and the standard error envelope.

use crate::AppState;
use crate::auth::{Principal, Role, extract_api_key};
use apg_core::{
    Approval, ApprovalStatus, DecisionResponse, ErrorEnvelope, ExecuteResponse, GatewayRequest,
};
use apg_store::RecordFilter;
use axum::{
    Json,
    extract::rejection::JsonRejection,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// API-layer failure mapped to the standard envelope.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Structured detail.
    pub details: Option<serde_json::Value>,
    /// `Retry-After` seconds for 429 responses.
    pub retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            details: None,
            retry_after: None,
        }
    }

    fn unauthenticated() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "UNAUTHENTICATED",
            "missing or unrecognised credentials",
        )
    }

    fn unauthorised() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "UNAUTHORISED",
            "credentials lack the required role or organisation",
        )
    }

    fn malformed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "MALFORMED_REQUEST", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            "internal gateway fault",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope = ErrorEnvelope {
            error: apg_core::ErrorBody {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        let mut resp = (self.status, Json(envelope)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        resp
    }
}

impl From<crate::service::GatewayError> for ApiError {
    fn from(e: crate::service::GatewayError) -> Self {
        tracing::error!("gateway fault: {e}");
        Self::internal()
    }
}

fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    required: Role,
) -> Result<Principal, ApiError> {
    let key = extract_api_key(headers).ok_or_else(ApiError::unauthenticated)?;
    let principal = state
        .auth
        .authenticate(&key)
        .ok_or_else(ApiError::unauthenticated)?;
    if !principal.role.permits(required) {
        return Err(ApiError::unauthorised());
    }
    Ok(principal)
}

fn require_org(principal: &Principal, org_id: &str) -> Result<(), ApiError> {
    if principal.org_id != org_id {
        return Err(ApiError::unauthorised());
    }
    Ok(())
}

async fn check_rate(state: &AppState, route: &str, key: &str) -> Result<(), ApiError> {
    state.limiter.check(route, key).await.map_err(|e| ApiError {
        status: StatusCode::TOO_MANY_REQUESTS,
        code: "RATE_LIMITED".into(),
        message: "too many requests".into(),
        details: None,
        retry_after: Some(e.retry_after_secs),
    })
}

fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match payload {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => Err(ApiError::malformed(rejection.body_text())),
    }
}

// ---------------------------------------------------------------------------
// Gateway endpoints
// ---------------------------------------------------------------------------

/// `POST /api/v1/gateway/evaluate`
pub async fn evaluate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<GatewayRequest>, JsonRejection>,
) -> Result<Json<DecisionResponse>, ApiError> {
    let principal = authenticate(&state, &headers, Role::Agent)?;
    check_rate(&state, "evaluate", &principal.principal).await?;
    let request = parse_body(payload)?;
    let response = state.gateway.evaluate(&principal.org_id, &request).await?;
    Ok(Json(response))
}

/// `POST /api/v1/gateway/execute`
pub async fn execute(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<GatewayRequest>, JsonRejection>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let principal = authenticate(&state, &headers, Role::Agent)?;
    check_rate(&state, "execute", &principal.principal).await?;
    let request = parse_body(payload)?;
    let response = state.gateway.execute(&principal.org_id, &request).await?;
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ApprovalListQuery {
    /// Filter by status.
    pub status: Option<String>,
    /// Page size.
    pub limit: Option<usize>,
    /// Page offset.
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ApprovalListResponse {
    pub approvals: Vec<Approval>,
    pub total: usize,
}

/// `GET /api/v1/orgs/{org_id}/approvals`
pub async fn list_approvals(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(org_id): Path<String>,
    Query(query): Query<ApprovalListQuery>,
) -> Result<Json<ApprovalListResponse>, ApiError> {
    let principal = authenticate(&state, &headers, Role::Operator)?;
    require_org(&principal, &org_id)?;
    check_rate(&state, "approvals", &principal.principal).await?;

    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            serde_json::from_value::<ApprovalStatus>(serde_json::Value::String(raw.to_string()))
                .map_err(|_| ApiError::malformed(format!("unknown status '{raw}'")))?,
        ),
    };

    let all = state.gateway.list_approvals(&org_id, status).await?;
    let total = all.len();
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(50);
    let approvals = all.into_iter().skip(offset).take(limit).collect();
    Ok(Json(ApprovalListResponse { approvals, total }))
}

#[derive(Debug, Serialize)]
pub struct ApproveResponse {
    pub approval: Approval,
    /// Returned only on this response; never retrievable again.
    pub override_token: String,
}

/// `POST /api/v1/orgs/{org_id}/approvals/{approval_id}/approve`
pub async fn approve(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org_id, approval_id)): Path<(String, Uuid)>,
) -> Result<Json<ApproveResponse>, ApiError> {
    let principal = authenticate(&state, &headers, Role::Operator)?;
    require_org(&principal, &org_id)?;

    let outcome = state
        .gateway
        .approvals()
        .approve(&org_id, approval_id, &principal.principal, Utc::now())
        .await
        .map_err(approval_error)?;
    Ok(Json(ApproveResponse {
        approval: outcome.approval,
        override_token: outcome.override_token,
    }))
}

/// `POST /api/v1/orgs/{org_id}/approvals/{approval_id}/deny`
pub async fn deny(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org_id, approval_id)): Path<(String, Uuid)>,
) -> Result<Json<Approval>, ApiError> {
    let principal = authenticate(&state, &headers, Role::Operator)?;
    require_org(&principal, &org_id)?;

    let approval = state
        .gateway
        .approvals()
        .deny(&org_id, approval_id, &principal.principal, Utc::now())
        .await
        .map_err(approval_error)?;
    Ok(Json(approval))
}

fn approval_error(e: apg_approval::ApprovalError) -> ApiError {
    match e {
        apg_approval::ApprovalError::NotFound => ApiError::not_found("approval not found"),
        apg_approval::ApprovalError::InvalidState(msg) => ApiError::conflict(msg),
        apg_approval::ApprovalError::Store(e) => {
            tracing::error!("approval store fault: {e}");
            ApiError::internal()
        }
    }
}

// ---------------------------------------------------------------------------
// Records, verification, export
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RecordListQuery {
    pub uapk_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RecordListResponse {
    pub records: Vec<apg_core::InteractionRecord>,
}

/// `GET /api/v1/orgs/{org_id}/interaction-records`
pub async fn list_records(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(org_id): Path<String>,
    Query(query): Query<RecordListQuery>,
) -> Result<Json<RecordListResponse>, ApiError> {
    let principal = authenticate(&state, &headers, Role::Viewer)?;
    require_org(&principal, &org_id)?;
    check_rate(&state, "records", &principal.principal).await?;

    let filter = RecordFilter {
        uapk_id: query.uapk_id,
        from: query.from,
        to: query.to,
        limit: Some(query.limit.unwrap_or(100)),
        offset: query.offset,
    };
    let records = state.gateway.list_records(&org_id, &filter).await?;
    Ok(Json(RecordListResponse { records }))
}

#[derive(Debug, Serialize)]
pub struct VerifyChainResponse {
    pub org_id: String,
    pub chains: Vec<apg_audit::ChainReport>,
}

/// `GET /api/v1/orgs/{org_id}/logs/verify-chain`
pub async fn verify_chain(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(org_id): Path<String>,
) -> Result<Json<VerifyChainResponse>, ApiError> {
    let principal = authenticate(&state, &headers, Role::Viewer)?;
    require_org(&principal, &org_id)?;

    let chains = state.gateway.verify_chains(&org_id).await?;
    Ok(Json(VerifyChainResponse { org_id, chains }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportRequest {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// `POST /api/v1/orgs/{org_id}/audit/export`
pub async fn export_audit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(org_id): Path<String>,
    payload: Result<Json<ExportRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let principal = authenticate(&state, &headers, Role::Viewer)?;
    require_org(&principal, &org_id)?;

    let request = match payload {
        Ok(Json(body)) => body,
        // An empty body is a full export.
        Err(JsonRejection::MissingJsonContentType(_)) => ExportRequest::default(),
        Err(rejection) => return Err(ApiError::malformed(rejection.body_text())),
    };

    let bundle = state
        .gateway
        .export_audit(&org_id, request.from, request.to)
        .await?;
    let mut resp = bundle.bytes.into_response();
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/gzip"),
    );
    resp.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        header::HeaderValue::from_static("attachment; filename=\"audit-export.tar.gz\""),
    );
    Ok(resp)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// `GET /readyz`
pub async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    if state.gateway.ready().await {
        Json(serde_json::json!({"status": "ready", "database": true})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "degraded", "database": false})),
        )
            .into_response()
    }
}
