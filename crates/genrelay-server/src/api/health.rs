// Health, readiness and metrics endpoints
// Decision: /health is liveness plus the cached dependency report; /readyz runs the checks live

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use genrelay_worker::PoolSnapshot;
use serde::Serialize;
use utoipa::ToSchema;

use crate::app::AppState;
use crate::broadcast::BroadcastState;
use crate::dispatch::DispatchMode;
use crate::readiness::ReadinessReport;

/// Liveness plus a snapshot of the pipeline
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub dispatch_mode: DispatchMode,
    pub auth_mode: String,
    pub pending_jobs: usize,
    #[schema(value_type = Option<Object>)]
    pub pool: Option<PoolSnapshot>,
    pub broadcast: BroadcastState,
    pub dead_letters: usize,
    pub readiness: ReadinessReport,
}

/// Readiness probe body
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReadyResponse {
    pub ready: bool,
    pub failures: Vec<String>,
}

/// GET /health - Liveness and pipeline state
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Process is alive", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dispatch_mode: state.gateway.mode(),
        auth_mode: state.auth.mode.to_string(),
        pending_jobs: state.gateway.pending(),
        pool: state.pool.as_ref().map(|pool| pool.snapshot()),
        broadcast: state.broadcaster.state(),
        dead_letters: state.dead_letters.len(),
        readiness: state.readiness.last_report(),
    })
}

/// GET /readyz - Readiness probe
#[utoipa::path(
    get,
    path = "/readyz",
    responses(
        (status = 200, description = "Ready to serve traffic", body = ReadyResponse),
        (status = 503, description = "A dependency is unhealthy", body = ReadyResponse)
    ),
    tag = "health"
)]
pub async fn readyz(State(state): State<AppState>) -> Response {
    let report = state.readiness.check_ready().await;
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            ready: report.ready,
            failures: report.failures,
        }),
    )
        .into_response()
}

/// GET /metrics - Prometheus text exposition
#[utoipa::path(
    get,
    path = "/metrics",
    responses(
        (status = 200, description = "Prometheus metrics", content_type = "text/plain")
    ),
    tag = "health"
)]
pub async fn metrics(State(state): State<AppState>) -> Response {
    if let Some(pool) = &state.pool {
        let snapshot = pool.snapshot();
        state.metrics.set_pool_state(snapshot.queued, snapshot.busy);
    }
    state.metrics.set_pending_jobs(state.gateway.pending());

    match state.metrics.encode_text() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
