// Error taxonomy for the generation pipeline
//
// Every rejected or failed job surfaces one of these with a stable code string.
// Orphaned and malformed results are never surfaced to a caller; they only
// exist as dead-letter reasons (see dead_letter.rs).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobId;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct FieldError {
    /// Dotted path of the offending field (e.g. "request.type").
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors a caller can observe for a single job
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Request payload is malformed; no job created
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        fields: Vec<FieldError>,
    },

    /// State payload is malformed; no job created
    #[error("invalid state: {message}")]
    InvalidState {
        message: String,
        fields: Vec<FieldError>,
    },

    /// Missing or invalid credentials
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but lacking the required scope
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Rate limit window exhausted for this caller
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Pending job backlog is at capacity
    #[error("job backlog is full (limit {limit})")]
    BacklogFull { limit: usize },

    /// Job was accepted but no result arrived in time
    #[error("job {job_id} timed out after {timeout_ms}ms")]
    JobTimeout { job_id: JobId, timeout_ms: u64 },

    /// Generation backend reported a failure
    #[error("generation backend failed: {0}")]
    Backend(String),

    /// Result was withheld by the quality gate
    #[error("result quality {score} is below the minimum {minimum}")]
    QualityRejected { score: f64, minimum: f64 },

    /// Broker or store is unreachable
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create an invalid request error without field detail
    pub fn invalid_request(message: impl Into<String>) -> Self {
        GatewayError::InvalidRequest {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Create an invalid state error without field detail
    pub fn invalid_state(message: impl Into<String>) -> Self {
        GatewayError::InvalidState {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        GatewayError::Backend(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        GatewayError::DependencyUnavailable(message.into())
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest { .. } => "invalid_request",
            GatewayError::InvalidState { .. } => "invalid_state",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::BacklogFull { .. } => "backlog_full",
            GatewayError::JobTimeout { .. } => "job_timeout",
            GatewayError::Backend(_) => "backend_error",
            GatewayError::QualityRejected { .. } => "quality_rejected",
            GatewayError::DependencyUnavailable(_) => "dependency_unavailable",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Retry-after hint in seconds, for load-shedding rejections
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            GatewayError::BacklogFull { .. } => Some(1),
            _ => None,
        }
    }

    /// Whether resubmitting the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. }
                | GatewayError::BacklogFull { .. }
                | GatewayError::JobTimeout { .. }
                | GatewayError::DependencyUnavailable(_)
        )
    }

    /// Field-level validation detail, if any
    pub fn fields(&self) -> &[FieldError] {
        match self {
            GatewayError::InvalidRequest { fields, .. } | GatewayError::InvalidState { fields, .. } => {
                fields
            }
            _ => &[],
        }
    }

    /// Job id this error refers to, if it concerns an accepted job
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            GatewayError::JobTimeout { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }
}
