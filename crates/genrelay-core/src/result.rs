// Result and outcome types
//
// GenerationResult is the wire shape of the result topic. JobOutcome is the
// settled, caller-facing view recorded for detached and inline jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{BackendError, GenerationOutput};
use crate::error::GatewayError;
use crate::job::JobId;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// A backend result as published on the result topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    /// Correlation key. Absent on malformed results.
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default = "Utc::now")]
    pub produced_at: DateTime<Utc>,
}

impl GenerationResult {
    /// Build a result from a backend call
    pub fn from_backend(job_id: JobId, result: Result<GenerationOutput, BackendError>) -> Self {
        match result {
            Ok(output) => Self {
                job_id: Some(job_id),
                success: true,
                payload: Some(output.payload),
                error: None,
                quality_score: output.quality_score,
                produced_at: Utc::now(),
            },
            Err(e) => Self {
                job_id: Some(job_id),
                success: false,
                payload: None,
                error: Some(e.to_string()),
                quality_score: None,
                produced_at: Utc::now(),
            },
        }
    }

    /// Convert into the outcome a waiter receives
    ///
    /// A `success: true` result without a payload resolves to `null`.
    pub fn into_outcome(self) -> Result<GenerationOutput, GatewayError> {
        if self.success {
            Ok(GenerationOutput {
                payload: self.payload.unwrap_or(Value::Null),
                quality_score: self.quality_score,
            })
        } else {
            Err(GatewayError::Backend(
                self.error
                    .unwrap_or_else(|| "backend reported failure".to_string()),
            ))
        }
    }
}

/// Settled outcome of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded {
        #[cfg_attr(feature = "openapi", schema(value_type = Object))]
        payload: Value,
        #[serde(
            default,
            rename = "qualityScore",
            skip_serializing_if = "Option::is_none"
        )]
        quality_score: Option<f64>,
    },
    Failed {
        /// Stable error code
        error: String,
        message: String,
    },
}

impl From<&Result<GenerationOutput, GatewayError>> for JobOutcome {
    fn from(result: &Result<GenerationOutput, GatewayError>) -> Self {
        match result {
            Ok(output) => JobOutcome::Succeeded {
                payload: output.payload.clone(),
                quality_score: output.quality_score,
            },
            Err(e) => JobOutcome::Failed {
                error: e.code().to_string(),
                message: e.to_string(),
            },
        }
    }
}

/// Outcome stored for later retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRecord {
    pub job_id: JobId,
    pub outcome: JobOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl OutcomeRecord {
    pub fn new(job_id: JobId, outcome: JobOutcome) -> Self {
        Self {
            job_id,
            outcome,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_without_job_id_decodes() {
        let result: GenerationResult =
            serde_json::from_value(json!({"success": true, "payload": {"a": 1}})).unwrap();
        assert!(result.job_id.is_none());
        assert!(result.success);
    }

    #[test]
    fn test_failed_result_becomes_backend_error() {
        let job_id = JobId::new();
        let result = GenerationResult::from_backend(job_id, Err(BackendError::new("oom")));
        assert!(!result.success);

        let outcome = result.into_outcome();
        assert_eq!(outcome, Err(GatewayError::Backend("oom".to_string())));
    }

    #[test]
    fn test_successful_result_keeps_quality_score() {
        let job_id = JobId::new();
        let output = GenerationOutput::new(json!({"text": "hi"})).with_quality_score(0.9);
        let result = GenerationResult::from_backend(job_id, Ok(output));

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["jobId"], json!(job_id.to_string()));
        assert_eq!(value["qualityScore"], json!(0.9));

        let outcome = result.into_outcome().unwrap();
        assert_eq!(outcome.payload, json!({"text": "hi"}));
    }

    #[test]
    fn test_job_outcome_wire_format() {
        let outcome = JobOutcome::from(&Err::<GenerationOutput, _>(GatewayError::JobTimeout {
            job_id: JobId::new(),
            timeout_ms: 10,
        }));
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "job_timeout");
    }
}
