// Rate limiting middleware backed by the shared-store limiter.
// Identity is the first X-Forwarded-For hop, else the peer address.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use resilience::Decision;
use serde::Serialize;

use crate::AppState;

const UNKNOWN_IDENTITY: &str = "unknown";

#[derive(Debug, Serialize)]
pub struct RateLimitError {
    pub error: String,
    pub code: u16,
    pub retry_after_seconds: u64,
}

// Monitoring routes stay reachable while clients are throttled
fn is_exempt(path: &str) -> bool {
    matches!(path, "/" | "/health" | "/metrics" | "/api/health") || path.starts_with("/api/errors/")
}

/// Client identity for limiting
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
}

fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

/// Counts the request against the configured rules; 429 when denied
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if is_exempt(&path) {
        return next.run(req).await;
    }

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = client_identity(req.headers(), peer);

    let decision = state.layer.limiter().check(&identity, &path).await;
    if let Decision::Denied { retry_after, .. } = decision {
        let body = RateLimitError {
            error: format!("Rate limit exceeded, retry in {} seconds", retry_after),
            code: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            retry_after_seconds: retry_after,
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        apply_headers(response.headers_mut(), &decision);
        return response;
    }

    let mut response = next.run(req).await;
    apply_headers(response.headers_mut(), &decision);
    response
}
