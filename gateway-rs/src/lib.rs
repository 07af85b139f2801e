//! HTTP front for the resilience layer: rate limiting on every API route
//! plus the health, dashboard and metrics endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use resilience::{Component, ResilienceLayer};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod rate_limit;

pub const SERVICE_NAME: &str = "gateway";

/// Shared application state
pub struct AppState {
    pub layer: ResilienceLayer,
    metrics: PrometheusHandle,
    started: Instant,
}

impl AppState {
    pub fn new(layer: ResilienceLayer, metrics: PrometheusHandle) -> Self {
        Self {
            layer,
            metrics,
            started: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub service_name: String,
    pub uptime_seconds: u64,
    pub store: String,
    pub store_reachable: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub component: Component,
    pub status: &'static str,
}

/// Registers descriptions for the layer's metrics
pub fn describe_metrics() {
    metrics::describe_counter!(
        "resilience.errors.recorded",
        "Error records by component and severity"
    );
    metrics::describe_counter!("resilience.retry.attempts", "Attempts made by the orchestrator");
    metrics::describe_counter!("resilience.retry.exhausted", "Calls that ran out of attempts");
    metrics::describe_counter!("resilience.fallback.invoked", "Fallbacks run after exhaustion");
    metrics::describe_counter!("resilience.rate_limit.denied", "Requests denied by scope");
    metrics::describe_counter!(
        "resilience.rate_limit.fail_open",
        "Requests allowed while the store was unavailable"
    );
    metrics::describe_gauge!(
        "resilience.health.system_status",
        "0 healthy, 1 warning, 2 error, 3 critical"
    );
}

/// Monitoring routes plus `api`, all behind the rate limiter
pub fn create_router(state: Arc<AppState>, api: Router<Arc<AppState>>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/health", get(health_check_handler))
        .route("/api/errors/dashboard", get(dashboard_handler))
        .route("/api/errors/reset/:component", post(reset_handler))
        .merge(api)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "GET /health",
            "GET /metrics",
            "GET /api/health",
            "GET /api/errors/dashboard",
            "POST /api/errors/reset/:component"
        ]
    }))
}

// Liveness: the process answers even when the system is critical
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = state.layer.store();
    Json(HealthResponse {
        healthy: true,
        service_name: SERVICE_NAME.to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        store: store.backend().to_string(),
        store_reachable: store.ping().await.is_ok(),
    })
}

async fn health_check_handler(State(state): State<Arc<AppState>>) -> Response {
    let (check, code) = state.layer.health().health_check();
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(check)).into_response()
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.layer.health().dashboard().await)
}

async fn reset_handler(
    State(state): State<Arc<AppState>>,
    Path(component): Path<String>,
) -> Response {
    match component.parse::<Component>() {
        Ok(component) => {
            state.layer.health().reset(component);
            info!(component = %component, "Health reset requested");
            Json(ResetResponse {
                component,
                status: "reset",
            })
            .into_response()
        }
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: err.to_string(),
                code: StatusCode::BAD_REQUEST.as_u16(),
            }),
        )
            .into_response(),
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use resilience::{ManualClock, MemoryStore, RateLimitRule, ResilienceConfig, Severity};
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let mut config = ResilienceConfig::default();
        config.rate_limit.rules = vec![RateLimitRule::endpoint("api/chat", 2, 60)];

        let clock = Arc::new(ManualClock::fixed());
        let layer = ResilienceLayer::with_parts(
            config,
            Arc::new(MemoryStore::with_clock(clock.clone())),
            clock,
        )
        .unwrap();
        let metrics = PrometheusBuilder::new().build_recorder().handle();
        Arc::new(AppState::new(layer, metrics))
    }

    fn app(state: Arc<AppState>) -> Router {
        let api = Router::new().route("/api/chat", post(|| async { "ok" }));
        create_router(state, api)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_chat(forwarded_for: &str) -> Request<Body> {
        Request::post("/api/chat")
            .header("x-forwarded-for", forwarded_for)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_chat_route_is_limited_per_endpoint() {
        let state = test_state();

        for remaining in ["1", "0"] {
            let response = app(state.clone()).oneshot(post_chat("198.51.100.7")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
        }

        let response = app(state.clone()).oneshot(post_chat("203.0.113.5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "60");

        let body = json_body(response).await;
        assert_eq!(body["code"], 429);
        assert_eq!(body["retry_after_seconds"], 60);
    }

    #[tokio::test]
    async fn test_health_check_turns_503_on_critical() {
        let state = test_state();
        let request = || Request::get("/api/health").body(Body::empty()).unwrap();

        let response = app(state.clone()).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");

        state
            .layer
            .tracker()
            .record(Component::Store, Severity::Critical, "connection refused", vec![])
            .await;

        let response = app(state.clone()).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["status"], "critical");
        assert_eq!(body["components"]["STORE"], "critical");
    }

    #[tokio::test]
    async fn test_reset_clears_component_status() {
        let state = test_state();
        state
            .layer
            .tracker()
            .record(Component::Llm, Severity::Critical, "provider down", vec![])
            .await;

        let response = app(state.clone())
            .oneshot(
                Request::post("/api/errors/reset/llm")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["component"], "LLM");

        let response = app(state.clone())
            .oneshot(Request::get("/api/errors/dashboard").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["status"]["system_status"], "healthy");
        assert_eq!(body["recent_errors"][0]["message"], "provider down");
        assert_eq!(body["trends"]["LLM"].as_array().unwrap().len(), 24);
    }

    #[tokio::test]
    async fn test_unknown_component_is_rejected() {
        let response = app(test_state())
            .oneshot(
                Request::post("/api/errors/reset/billing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], 400);
    }

    #[tokio::test]
    async fn test_liveness_reports_store_backend() {
        let response = app(test_state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["healthy"], true);
        assert_eq!(body["store"], "memory");
        assert_eq!(body["store_reachable"], true);
    }
}
