// Dead-letter audit records
//
// Entries are append-only. Nothing in genrelay ever removes one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobId;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Why a message could not be delivered normally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// No result arrived before the job's deadline
    Timeout,
    /// A result arrived for a job nobody is waiting on
    OrphanResult,
    /// A result arrived without a job id
    MissingJobId,
    /// Handling the result failed
    ProcessingError,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Timeout => "timeout",
            DeadLetterReason::OrphanResult => "orphan_result",
            DeadLetterReason::MissingJobId => "missing_job_id",
            DeadLetterReason::ProcessingError => "processing_error",
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record for an undeliverable or unprocessable message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub reason: DeadLetterReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Original message body, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub raw: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(reason: DeadLetterReason) -> Self {
        Self {
            reason,
            job_id: None,
            raw: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn timeout(job_id: JobId, timeout_ms: u64) -> Self {
        Self::new(DeadLetterReason::Timeout)
            .with_job_id(job_id)
            .with_detail(format!("no result within {timeout_ms}ms"))
    }

    pub fn orphan(job_id: JobId, raw: Value) -> Self {
        Self::new(DeadLetterReason::OrphanResult)
            .with_job_id(job_id)
            .with_raw(raw)
    }

    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
