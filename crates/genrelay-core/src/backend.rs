// Generation backend seam
// Decision: The backend is synchronous. It runs on pinned worker threads, never on the runtime.
// Decision: Panics are the pool's problem; implementations just return errors.

use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// Output of a successful generation
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub payload: Value,
    /// Backend-reported quality in [0, 1], consumed by the quality gate
    pub quality_score: Option<f64>,
}

impl GenerationOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            quality_score: None,
        }
    }

    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }
}

/// Backend failure, surfaced to the waiter as `backend_error`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The content-generation algorithm, treated as a black box
pub trait GenerationBackend: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &str {
        "backend"
    }

    /// Map a request and state to a payload. May take seconds.
    fn generate(&self, request: &Value, state: &Value) -> Result<GenerationOutput, BackendError>;
}

/// Backend that echoes its inputs, optionally after a fixed delay
#[derive(Debug, Clone, Default)]
pub struct EchoBackend {
    delay: Option<Duration>,
}

impl EchoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl GenerationBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    fn generate(&self, request: &Value, state: &Value) -> Result<GenerationOutput, BackendError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(GenerationOutput::new(json!({
            "request": request,
            "state": state,
        }))
        .with_quality_score(1.0))
    }
}
