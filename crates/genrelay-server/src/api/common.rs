// Common DTOs and the HTTP error mapping
//
// Every error body has the same shape: a stable `error` code plus a human
// message, with optional job id, retry hint and field detail.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use genrelay_core::{FieldError, GatewayError, JobId};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Standard error response for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Stable error code (e.g. `backlog_full`).
    pub error: String,
    /// Human-readable description.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Seconds to wait before retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            job_id: None,
            retry_after: None,
            fields: Vec::new(),
        }
    }

    /// Convert to axum response tuple
    pub fn into_response(self, status: StatusCode) -> (StatusCode, Json<Self>) {
        (status, Json(self))
    }
}

impl From<&GatewayError> for ErrorResponse {
    fn from(err: &GatewayError) -> Self {
        Self {
            error: err.code().to_string(),
            message: err.to_string(),
            job_id: err.job_id(),
            retry_after: err.retry_after(),
            fields: err.fields().to_vec(),
        }
    }
}

/// Response wrapper for list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// HTTP status for each error code
pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::InvalidRequest { .. } | GatewayError::InvalidState { .. } => {
            StatusCode::BAD_REQUEST
        }
        GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
        GatewayError::RateLimited { .. } | GatewayError::BacklogFull { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
        GatewayError::JobTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Backend(_)
        | GatewayError::QualityRejected { .. }
        | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        GatewayError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Gateway error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError {
    pub error: GatewayError,
    /// Set once the job was accepted, so the caller can correlate the failure
    pub job_id: Option<JobId>,
}

impl ApiError {
    pub fn for_job(error: GatewayError, job_id: JobId) -> Self {
        Self {
            error,
            job_id: Some(job_id),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self {
            error,
            job_id: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);
        if status.is_server_error() {
            tracing::warn!(
                code = self.error.code(),
                job_id = ?self.job_id,
                error = %self.error,
                "Request failed"
            );
        }

        let mut body = ErrorResponse::from(&self.error);
        if body.job_id.is_none() {
            body.job_id = self.job_id;
        }
        let retry_after = body.retry_after;
        let mut response = body.into_response(status).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
