// Job domain types
//
// A Job is created by the gateway on acceptance and never mutated afterwards.
// It is serialized as-is onto the request topic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Globally unique job identifier (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema), schema(value_type = String, format = Uuid))]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh job id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A unit of generation work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Correlation key for the eventual result.
    pub id: JobId,
    /// Opaque request object handed to the backend.
    pub request: Value,
    /// Opaque state object handed to the backend.
    pub state: Value,
    pub submitted_at: DateTime<Utc>,
    /// Subject of the principal that submitted the job.
    pub auth_principal: String,
}

impl Job {
    pub fn new(request: Value, state: Value, auth_principal: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            request,
            state,
            submitted_at: Utc::now(),
            auth_principal: auth_principal.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_job_ids_are_unique() {
        let ids: HashSet<JobId> = (0..1000).map(|_| JobId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_job_id_parse_and_display() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_wire_format_is_camel_case() {
        let job = Job::new(json!({"type": "manual"}), json!({}), "svc-a");
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["id"], json!(job.id.to_string()));
        assert_eq!(value["request"]["type"], "manual");
        assert_eq!(value["authPrincipal"], "svc-a");
        assert!(value.get("submittedAt").is_some());
    }
}
