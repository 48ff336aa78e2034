// Input validation for generation requests
//
// `request` and `state` are opaque objects. Deployments can add a JSON Schema
// for either one through REQUEST_SCHEMA / STATE_SCHEMA.
//
// Decision: Every schema violation is reported, each as a dotted field path

use std::fmt;
use std::sync::Arc;

use genrelay_core::{FieldError, GatewayError};
use jsonschema::error::ValidationErrorKind;
use serde_json::{Map, Value};
use thiserror::Error;

/// Maximum serialized size for one of `request` or `state`.
pub const MAX_INPUT_BYTES: usize = 1024 * 1024; // 1 MB

/// Schema loading errors
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid JSON schema: {0}")]
    Invalid(String),
}

/// Compiled JSON Schema for `request` or `state`
#[derive(Clone)]
pub struct FieldSchema {
    source: Value,
    compiled: Arc<jsonschema::Validator>,
}

impl fmt::Debug for FieldSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSchema")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl PartialEq for FieldSchema {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl FieldSchema {
    pub fn new(schema: Value) -> Result<Self, SchemaError> {
        let compiled = jsonschema::options()
            .build(&schema)
            .map_err(|e| SchemaError::Invalid(e.to_string()))?;
        Ok(Self {
            source: schema,
            compiled: Arc::new(compiled),
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, SchemaError> {
        Self::new(serde_json::from_str(raw)?)
    }

    /// Collect every violation; `prefix` names the top-level object
    pub fn check(&self, prefix: &str, value: &Value) -> Vec<FieldError> {
        self.compiled
            .iter_errors(value)
            .map(|error| {
                let mut field = pointer_to_field(prefix, &error.instance_path().to_string());
                // A missing property is reported against its parent object
                if let ValidationErrorKind::Required { property } = error.kind() {
                    if let Some(name) = property.as_str() {
                        field.push('.');
                        field.push_str(name);
                    }
                }
                FieldError::new(field, error.to_string())
            })
            .collect()
    }
}

/// `/meta/0/size` under `request` becomes `request.meta.0.size`
fn pointer_to_field(prefix: &str, pointer: &str) -> String {
    let mut field = prefix.to_string();
    for segment in pointer.split('/').filter(|s| !s.is_empty()) {
        field.push('.');
        field.push_str(&segment.replace("~1", "/").replace("~0", "~"));
    }
    field
}

/// Validates and normalizes submission input
#[derive(Debug, Clone, Default)]
pub struct Validator {
    request_schema: Option<FieldSchema>,
    state_schema: Option<FieldSchema>,
}

impl Validator {
    pub fn new(request_schema: Option<FieldSchema>, state_schema: Option<FieldSchema>) -> Self {
        Self {
            request_schema,
            state_schema,
        }
    }

    /// Returns `(request, state)`, each defaulting to `{}`
    pub fn validate(
        &self,
        request: Option<Value>,
        state: Option<Value>,
    ) -> Result<(Value, Value), GatewayError> {
        let request = normalize(request).ok_or_else(|| {
            GatewayError::invalid_request("`request` must be a JSON object")
        })?;
        let state = normalize(state)
            .ok_or_else(|| GatewayError::invalid_state("`state` must be a JSON object"))?;

        if encoded_len(&request) > MAX_INPUT_BYTES {
            return Err(GatewayError::invalid_request("`request` exceeds allowed size"));
        }
        if encoded_len(&state) > MAX_INPUT_BYTES {
            return Err(GatewayError::invalid_state("`state` exceeds allowed size"));
        }

        if let Some(schema) = &self.request_schema {
            let fields = schema.check("request", &request);
            if !fields.is_empty() {
                tracing::debug!(violations = fields.len(), "Request failed schema validation");
                return Err(GatewayError::InvalidRequest {
                    message: "request does not match schema".to_string(),
                    fields,
                });
            }
        }

        if let Some(schema) = &self.state_schema {
            let fields = schema.check("state", &state);
            if !fields.is_empty() {
                return Err(GatewayError::InvalidState {
                    message: "state does not match schema".to_string(),
                    fields,
                });
            }
        }

        Ok((request, state))
    }
}

/// `None`/`null` become `{}`; any other non-object is rejected
fn normalize(value: Option<Value>) -> Option<Value> {
    match value {
        None | Some(Value::Null) => Some(Value::Object(Map::new())),
        Some(v @ Value::Object(_)) => Some(v),
        Some(_) => None,
    }
}

fn encoded_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_inputs_default_to_empty_objects() {
        let (request, state) = Validator::default().validate(None, None).unwrap();
        assert_eq!(request, json!({}));
        assert_eq!(state, json!({}));
    }

    #[test]
    fn test_non_object_request_rejected() {
        let err = Validator::default()
            .validate(Some(json!("text")), None)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn test_non_object_state_rejected() {
        let err = Validator::default()
            .validate(Some(json!({})), Some(json!([1, 2])))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_state");
    }

    #[test]
    fn test_schema_reports_field_errors() {
        let schema = FieldSchema::new(json!({
            "type": "object",
            "required": ["type", "seed"],
            "properties": {"type": {"type": "string"}, "seed": {"type": "integer"}}
        }))
        .unwrap();
        let validator = Validator::new(Some(schema), None);

        let err = validator
            .validate(Some(json!({"type": 7})), None)
            .unwrap_err();
        let fields = err.fields();
        assert_eq!(fields.len(), 2);
        assert!(fields
            .iter()
            .any(|f| f.field == "request.seed" && f.message.contains("required")));
        assert!(fields.iter().any(|f| f.field == "request.type"));

        assert!(validator
            .validate(Some(json!({"type": "manual", "seed": 3})), None)
            .is_ok());
    }

    #[test]
    fn test_nested_paths_are_dotted() {
        let schema = FieldSchema::new(json!({
            "type": "object",
            "properties": {
                "meta": {
                    "type": "object",
                    "properties": {"tags": {"type": "array", "items": {"type": "string"}}}
                }
            }
        }))
        .unwrap();

        let fields = schema.check("request", &json!({"meta": {"tags": ["a", 2]}}));
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].field, "request.meta.tags.1");
    }

    #[test]
    fn test_state_schema() {
        let schema = FieldSchema::from_json(r#"{"required": ["frame"]}"#).unwrap();
        let validator = Validator::new(None, Some(schema));

        let err = validator.validate(None, Some(json!({}))).unwrap_err();
        assert_eq!(err.code(), "invalid_state");
        assert_eq!(err.fields()[0].field, "state.frame");
    }

    #[test]
    fn test_invalid_schema_is_rejected() {
        assert!(matches!(
            FieldSchema::from_json(r#"{"type": "date"}"#),
            Err(SchemaError::Invalid(_))
        ));
        assert!(matches!(
            FieldSchema::from_json("{oops"),
            Err(SchemaError::Json(_))
        ));
    }
}
