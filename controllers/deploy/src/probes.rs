//! Health probe and metrics HTTP servers.
//!
//! Serves:
//! - `GET /healthz` on the probe address: liveness, always 200
//! - `GET /readyz` on the probe address: 200 once the Deployment cache has synced, 503 before
//! - `GET /metrics` on the metrics address: Prometheus text format

use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::watcher::Watcher;
use axum::{extract::State, http::StatusCode, http::header, response::IntoResponse, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// State behind the health probe routes.
#[derive(Clone)]
pub struct ProbeState {
    watcher: Arc<Watcher>,
}

impl ProbeState {
    /// Readiness follows `watcher`'s cache sync.
    pub fn new(watcher: Arc<Watcher>) -> Self {
        Self { watcher }
    }
}

/// Routes for `/healthz` and `/readyz`.
pub fn probe_router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Route for `/metrics`.
pub fn metrics_router(metrics: Metrics) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).with_state(metrics)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<ProbeState>) -> impl IntoResponse {
    if state.watcher.is_synced() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "cache not synced")
    }
}

async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Bind a listener, failing setup if the address is unavailable.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ControllerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Probe(format!("failed to bind {addr}: {e}")))
}

/// Serve `router` on `listener` until `shutdown` flips to true.
pub async fn serve(listener: TcpListener, router: Router, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
    let addr = listener
        .local_addr()
        .map_err(|e| ControllerError::Probe(e.to_string()))?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| {
            error!(%addr, error = %e, "HTTP server failed");
            ControllerError::Probe(e.to_string())
        })
}
