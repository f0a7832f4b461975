//! Local query surface: health, readiness, metrics, and read-only run
//! documents.
//!
//! Handlers only read local state and never await the network. The `/runs`
//! routes let a monitor follow progress while this worker holds the
//! checkpoint store.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::{StorageError, WorkerError};
use crate::health::HealthMonitor;
use crate::telemetry::WorkerMetrics;

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
pub struct HttpState {
    pub health: Arc<HealthMonitor>,
    pub metrics: WorkerMetrics,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/runs", get(list_runs))
        .route("/runs/:run_id", get(get_run))
        .with_state(state)
}

async fn health(State(state): State<HttpState>) -> Response {
    let report = state.health.check_health();
    let code = if report.status.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

async fn ready(State(state): State<HttpState>) -> Response {
    let report = state.health.check_readiness();
    let code = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

async fn metrics(State(state): State<HttpState>) -> Response {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render(),
    )
        .into_response()
}

fn storage_failure(err: StorageError) -> Response {
    warn!(error = %err, "Checkpoint read failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

async fn list_runs(State(state): State<HttpState>) -> Response {
    match state.checkpoints.list() {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => storage_failure(e),
    }
}

async fn get_run(State(state): State<HttpState>, Path(run_id): Path<String>) -> Response {
    match state.checkpoints.get(&run_id) {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("run {} not found", run_id) })),
        )
            .into_response(),
        Err(e) => storage_failure(e),
    }
}

/// Bind `listen` and serve until `shutdown` resolves.
pub async fn serve(
    listen: SocketAddr,
    state: HttpState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), WorkerError> {
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| WorkerError::HttpError(format!("bind {listen}: {e}")))?;
    serve_on(listener, state, shutdown).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_on(
    listener: TcpListener,
    state: HttpState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), WorkerError> {
    if let Ok(addr) = listener.local_addr() {
        info!(listen = %addr, "Health endpoint listening");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| WorkerError::HttpError(e.to_string()))
}
