// HTTP and WebSocket routes
//
// Handlers share one AppState; auth is resolved per request by the Caller extractors.

pub mod common;
pub mod dead_letters;
pub mod generate;
pub mod health;
pub mod jobs;
pub mod ws;

use axum::{
    routing::{get, post},
    Json, Router,
};
use utoipa::OpenApi;

use crate::app::AppState;
use crate::openapi::ApiDoc;

pub use common::{ApiError, ErrorResponse, ListResponse};

/// All routes, with state applied
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/generate", post(generate::generate))
        .route("/jobs/:job_id", get(jobs::get_job))
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health::health))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(health::metrics))
        .route("/v1/dead-letters", get(dead_letters::list_dead_letters))
        .route("/api-doc/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .with_state(state)
}
