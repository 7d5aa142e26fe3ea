//! Admin API
//!
//! Runs on a separate listener (default 127.0.0.1:9090) so operational
//! endpoints are never reachable through the balanced port.
//!
//! Endpoints:
//! - GET    /health         : pool health, uptime, request counters
//! - GET    /metrics        : Prometheus text exposition
//! - GET    /admin/backends : list backends with state
//! - POST   /admin/backends : add a backend `{"url": ...}`
//! - DELETE /admin/backends : remove a backend `{"url": ...}`

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use resource_pool::Pool;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::info;

use crate::balancer::{Backend, Counters};
use crate::monitor::HealthySet;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub pool: Arc<Pool<Backend>>,
    pub healthy: watch::Receiver<HealthySet>,
    pub counters: Arc<Counters>,
    pub prometheus: PrometheusHandle,
}

/// Build the admin router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/admin/backends",
            get(list_backends).post(add_backend).delete(remove_backend),
        )
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> axum::response::Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /health: 200 while at least one backend is published healthy, 503 otherwise.
async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let mut body = state.pool.health().await;
    let healthy_backends = state.healthy.borrow().len();

    body["healthy_backends"] = serde_json::json!(healthy_backends);
    body["uptime_seconds"] = serde_json::json!(state.counters.started_at.elapsed().as_secs());
    body["requests_served"] =
        serde_json::json!(state.counters.requests_total.load(Ordering::Relaxed));
    body["errors_total"] = serde_json::json!(state.counters.errors_total.load(Ordering::Relaxed));

    let status = if healthy_backends > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, body)
}

/// GET /metrics: Prometheus text exposition format.
async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// GET /admin/backends
async fn list_backends(State(state): State<AdminState>) -> impl IntoResponse {
    let health = state.pool.health().await;
    let backends = health
        .get("members")
        .cloned()
        .unwrap_or(serde_json::json!([]));
    json_response(StatusCode::OK, serde_json::json!({ "backends": backends }))
}

#[derive(Deserialize)]
struct BackendRequest {
    url: String,
}

/// POST /admin/backends: new backends join as `unknown` and are published after their first passing probe.
async fn add_backend(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<BackendRequest>,
) -> impl IntoResponse {
    if !body.url.starts_with("http://") && !body.url.starts_with("https://") {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "url must start with http:// or https://" }),
        );
    }

    let backend = Backend::new(body.url);
    let url = backend.url().to_string();
    if state.pool.add(backend).await {
        info!(backend = %url, "backend added via admin API");
        json_response(StatusCode::CREATED, serde_json::json!({ "added": url }))
    } else {
        json_response(
            StatusCode::CONFLICT,
            serde_json::json!({ "error": format!("backend {url} already in pool") }),
        )
    }
}

/// DELETE /admin/backends
async fn remove_backend(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<BackendRequest>,
) -> impl IntoResponse {
    let url = body.url.trim_end_matches('/');
    match state.pool.remove(url).await {
        Some(removed) => {
            info!(backend = removed.url(), "backend removed via admin API");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "removed": removed.url() }),
            )
        }
        None => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": format!("backend {url} not in pool") }),
        ),
    }
}
