// Dead-letter listing (admin)

use axum::{
    extract::{Query, State},
    Json,
};
use genrelay_core::DeadLetterEntry;
use serde::Deserialize;
use utoipa::IntoParams;

use super::common::{ErrorResponse, ListResponse};
use crate::app::AppState;
use crate::auth::AdminCaller;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Deserialize, IntoParams)]
pub struct DeadLetterQuery {
    /// Maximum entries to return, newest first (default 100, max 1000)
    pub limit: Option<usize>,
}

/// GET /v1/dead-letters - Recent dead-letter entries
#[utoipa::path(
    get,
    path = "/v1/dead-letters",
    params(DeadLetterQuery),
    responses(
        (status = 200, description = "Recent entries, newest first", body = ListResponse<DeadLetterEntry>),
        (status = 401, description = "Missing or invalid credentials", body = ErrorResponse),
        (status = 403, description = "Admin scope required", body = ErrorResponse)
    ),
    tag = "operations"
)]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    AdminCaller(caller): AdminCaller,
    Query(query): Query<DeadLetterQuery>,
) -> Json<ListResponse<DeadLetterEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    tracing::debug!(principal = %caller.principal.subject, limit, "Listing dead letters");
    Json(ListResponse::new(state.dead_letters.recent(limit)))
}
