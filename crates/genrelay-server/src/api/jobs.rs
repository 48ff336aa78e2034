// Outcome lookup for detached jobs

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use genrelay_core::{GatewayError, JobId, OutcomeRecord};

use super::common::{ApiError, ErrorResponse};
use crate::app::AppState;
use crate::auth::Caller;

/// GET /jobs/{job_id} - Outcome of a settled job
#[utoipa::path(
    get,
    path = "/jobs/{job_id}",
    params(
        ("job_id" = String, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Recorded outcome", body = OutcomeRecord),
        (status = 401, description = "Missing or invalid credentials", body = ErrorResponse),
        (status = 404, description = "No outcome recorded for this job", body = ErrorResponse),
        (status = 503, description = "Outcome store unavailable", body = ErrorResponse)
    ),
    tag = "generation"
)]
pub async fn get_job(
    State(state): State<AppState>,
    _caller: Caller,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let Ok(job_id) = job_id.parse::<JobId>() else {
        return Ok(not_found(&job_id));
    };

    let record = state.store.get(job_id).await.map_err(|e| {
        tracing::warn!(job_id = %job_id, error = %e, "Outcome lookup failed");
        GatewayError::unavailable(e.to_string())
    })?;

    Ok(match record {
        Some(record) => Json(record).into_response(),
        None => not_found(&job_id.to_string()),
    })
}

fn not_found(job_id: &str) -> Response {
    ErrorResponse::new("not_found", format!("no outcome recorded for job {job_id}"))
        .into_response(StatusCode::NOT_FOUND)
        .into_response()
}
