// Job submission over HTTP
//
// Decision: Waiting for the outcome is the default; `?mode=async` answers 202 with the job id
// Decision: An empty body is the same as `{}`

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use genrelay_core::{GatewayError, JobId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};

use super::common::{ApiError, ErrorResponse};
use crate::app::AppState;
use crate::auth::Caller;
use crate::correlator::Resolution;
use crate::dispatch::{DeliveryMode, Dispatched};
use crate::gateway::SubmitInput;

/// Request body for POST /generate
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct GenerateRequest {
    /// Opaque request object handed to the backend. Defaults to `{}`.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub request: Option<Value>,
    /// Opaque state object handed to the backend. Defaults to `{}`.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub state: Option<Value>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct GenerateQuery {
    /// `async` to return immediately with the job id
    pub mode: Option<String>,
}

/// Successful generation
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub job_id: JobId,
    #[schema(value_type = Object)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
}

/// Job accepted for asynchronous processing
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub job_id: JobId,
}

fn wants_async(query: &GenerateQuery) -> Result<bool, GatewayError> {
    match query.mode.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("") | Some("wait") | Some("sync") => Ok(false),
        Some("async") => Ok(true),
        Some(other) => Err(GatewayError::invalid_request(format!(
            "unknown mode '{other}', expected async or wait"
        ))),
    }
}

fn parse_body(body: &[u8]) -> Result<GenerateRequest, GatewayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(GenerateRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::invalid_request(format!("body is not a valid JSON object: {e}")))
}

/// POST /generate - Submit a generation job
#[utoipa::path(
    post,
    path = "/generate",
    params(GenerateQuery),
    request_body = GenerateRequest,
    responses(
        (status = 200, description = "Job completed", body = GenerateResponse),
        (status = 202, description = "Job accepted (async mode)", body = AcceptedResponse),
        (status = 400, description = "Invalid request or state", body = ErrorResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorResponse),
        (status = 403, description = "Missing generate scope", body = ErrorResponse),
        (status = 429, description = "Rate limited or backlog full", body = ErrorResponse),
        (status = 500, description = "Backend failure or quality rejection", body = ErrorResponse),
        (status = 503, description = "Broker unavailable", body = ErrorResponse),
        (status = 504, description = "Job timed out", body = ErrorResponse)
    ),
    tag = "generation"
)]
pub async fn generate(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<GenerateQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let detached = wants_async(&query)?;
    let body = parse_body(&body)?;
    let delivery = if detached {
        DeliveryMode::Detached
    } else {
        DeliveryMode::Wait
    };

    let input = SubmitInput {
        request: body.request,
        state: body.state,
    };
    let dispatched = state
        .gateway
        .submit(&caller.principal, &caller.origin, input, delivery)
        .await?;

    match dispatched {
        Dispatched::Completed(resolution) => resolved(resolution),
        Dispatched::Pending {
            job_id,
            receiver: None,
        } => Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { job_id })).into_response()),
        Dispatched::Pending {
            job_id,
            receiver: Some(receiver),
        } => match receiver.await {
            Ok(resolution) => resolved(resolution),
            Err(_) => Err(ApiError::for_job(
                GatewayError::Internal("job waiter was dropped".to_string()),
                job_id,
            )),
        },
    }
}

fn resolved(resolution: Resolution) -> Result<Response, ApiError> {
    let job_id = resolution.job_id;
    match resolution.outcome {
        Ok(output) => Ok(Json(GenerateResponse {
            job_id,
            payload: output.payload,
            quality_score: output.quality_score,
        })
        .into_response()),
        Err(e) => Err(ApiError::for_job(e, job_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(mode: Option<&str>) -> GenerateQuery {
        GenerateQuery {
            mode: mode.map(str::to_string),
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert!(!wants_async(&query(None)).unwrap());
        assert!(!wants_async(&query(Some("wait"))).unwrap());
        assert!(wants_async(&query(Some("ASYNC"))).unwrap());
        assert_eq!(
            wants_async(&query(Some("later"))).unwrap_err().code(),
            "invalid_request"
        );
    }

    #[test]
    fn test_body_parsing() {
        let empty = parse_body(b"").unwrap();
        assert!(empty.request.is_none() && empty.state.is_none());

        let body = parse_body(br#"{"request": {"type": "manual"}}"#).unwrap();
        assert_eq!(body.request.unwrap()["type"], "manual");

        assert_eq!(parse_body(b"{oops").unwrap_err().code(), "invalid_request");
        assert_eq!(parse_body(b"[1, 2]").unwrap_err().code(), "invalid_request");
    }
}
