// OpenAPI specification generation
//
// Served at /api-doc/openapi.json. The WebSocket protocol is not described here.

use crate::api;
use crate::api::{ErrorResponse, ListResponse};
use crate::broadcast::BroadcastState;
use crate::dispatch::DispatchMode;
use crate::readiness::{DependencyStatus, ReadinessReport};
use genrelay_core::{DeadLetterEntry, DeadLetterReason, FieldError, JobId, JobOutcome, OutcomeRecord};
use utoipa::OpenApi;

/// OpenAPI documentation for the generation gateway
#[derive(OpenApi)]
#[openapi(
    paths(
        api::generate::generate,
        api::jobs::get_job,
        api::health::health,
        api::health::readyz,
        api::health::metrics,
        api::dead_letters::list_dead_letters,
    ),
    components(
        schemas(
            api::generate::GenerateRequest,
            api::generate::GenerateResponse,
            api::generate::AcceptedResponse,
            api::health::HealthResponse,
            api::health::ReadyResponse,
            ErrorResponse, FieldError,
            JobId, JobOutcome, OutcomeRecord,
            DeadLetterEntry, DeadLetterReason,
            ListResponse<DeadLetterEntry>,
            DispatchMode, BroadcastState,
            ReadinessReport, DependencyStatus,
        )
    ),
    tags(
        (name = "generation", description = "Job submission and outcome lookup"),
        (name = "health", description = "Liveness, readiness and metrics"),
        (name = "operations", description = "Operational endpoints")
    ),
    info(
        title = "Genrelay API",
        description = "Generation job gateway",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Generate the OpenAPI spec as a pretty-printed JSON string
    pub fn to_json() -> Result<String, serde_json::Error> {
        Self::openapi().to_pretty_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_routes() {
        let json = ApiDoc::to_json().unwrap();
        assert!(json.contains("/generate"));
        assert!(json.contains("/jobs/{job_id}"));
        assert!(json.contains("/v1/dead-letters"));
        assert!(json.contains("GenerateResponse"));
    }
}
