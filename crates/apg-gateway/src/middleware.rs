// SPDX-License-Identifier: MIT OR Apache-2.0
//! Middleware stack for the gateway HTTP API.

use apg_core::ErrorEnvelope;
use axum::{
    Json,
    extract::Request,
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::time::Instant;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::info;
use uuid::Uuid;

/// A unique request identifier, available as an Axum extension and echoed
/// in the `X-Request-Id` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

/// Generates a [`RequestId`] per request and sets the response header.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

/// Logs method, path, status, and duration with structured fields.
pub async fn request_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        "request completed"
    );
    resp
}

/// Rejects requests whose declared length exceeds `max_bytes`, before any
/// body is read. Bodies without a length declaration are bounded by the
/// router's body limit as a backstop.
pub async fn body_cap(req: Request, next: Next, max_bytes: usize) -> Response {
    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(len) = declared {
        if len > max_bytes {
            return payload_too_large(max_bytes);
        }
    }

    let resp = next.run(req).await;
    // The body-limit backstop emits a bare 413; rewrap it in the envelope.
    if resp.status() == StatusCode::PAYLOAD_TOO_LARGE
        && resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_none_or(|ct| !ct.starts_with("application/json"))
    {
        return payload_too_large(max_bytes);
    }
    resp
}

fn payload_too_large(max_bytes: usize) -> Response {
    let body = Json(ErrorEnvelope::new(
        "PAYLOAD_TOO_LARGE",
        format!("request body exceeds {max_bytes} bytes"),
    ));
    (StatusCode::PAYLOAD_TOO_LARGE, body).into_response()
}

/// Build the CORS layer from configured origins. No configured origins
/// means no cross-origin access.
#[must_use]
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::any())
        .allow_headers(AllowHeaders::any())
}
