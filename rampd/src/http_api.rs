//! HTTP API for metrics and health endpoints.
//!
//! Provides:
//! - `/metrics` - Prometheus metrics export
//! - `/health` - Basic daemon health check
//! - `/ready` - Readiness probe (flag store loaded, monitor not degraded)
//! - `/flags` - Read-only flag definitions, optionally `?environment=`

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;

use crate::metrics;
use crate::store::FlagStore;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    /// Flag store for read-only listings.
    pub store: Arc<FlagStore>,
    /// Degraded marker maintained by the health monitor.
    pub monitor_degraded: Arc<AtomicBool>,
    /// Daemon version.
    pub version: &'static str,
    /// Daemon start time.
    pub started_at: Instant,
    /// Daemon process ID.
    pub pid: u32,
}

/// Create the HTTP router for observability endpoints.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/flags", get(flags_handler))
        .with_state(Arc::new(state))
}

/// Handler for `/metrics` - Prometheus metrics export.
async fn metrics_handler() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

/// Handler for `/health` - Basic daemon health check.
///
/// Returns 200 OK if the daemon is running.
async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let uptime_secs = state.started_at.elapsed().as_secs();

    Json(json!({
        "status": "healthy",
        "version": state.version,
        "pid": state.pid,
        "uptime_seconds": uptime_secs,
    }))
}

/// Handler for `/ready` - Readiness probe.
///
/// The daemon serves evaluations as soon as the store is loaded; a
/// degraded monitor is reported but is not a readiness failure, since
/// evaluation traffic does not depend on the metrics feed.
async fn ready_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let flags = state.store.list(None);
    let active = flags
        .iter()
        .filter(|def| !def.archived && def.stage.is_monitored())
        .count();

    Json(json!({
        "status": "ready",
        "flags_total": flags.len(),
        "flags_active": active,
        "monitor_degraded": state.monitor_degraded.load(Ordering::Relaxed),
    }))
}

/// Handler for `/flags` - read-only definition listing.
async fn flags_handler(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let environment = params.get("environment").map(String::as_str);
    Json(state.store.list(environment))
}

/// Start the HTTP server for observability endpoints.
pub async fn start_server(
    port: u16,
    state: HttpState,
) -> tokio::task::JoinHandle<Result<(), std::io::Error>> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!("Starting HTTP server for observability on port {}", port);

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramp_common::types::{FlagDefinition, FlagId, Stage};

    fn state() -> HttpState {
        let store = Arc::new(FlagStore::new());
        let mut def = FlagDefinition::new(FlagId::new("checkout-v2"), "production");
        def.stage = Stage::Ramping;
        def.percentage = 25;
        store.create(def).unwrap();
        HttpState {
            store,
            monitor_degraded: Arc::new(AtomicBool::new(false)),
            version: "test",
            started_at: Instant::now(),
            pid: std::process::id(),
        }
    }

    #[tokio::test]
    async fn test_metrics_handler_exports_text_format() {
        metrics::record_evaluation("on");
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_reports_flag_counts() {
        let response = ready_handler(State(Arc::new(state()))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
