// Generation pipeline core
//
// Shared types for every genrelay crate:
// - Job and JobId, the unit of work correlated across async boundaries
// - GenerationResult, the wire shape of the result topic
// - DeadLetterEntry, the audit record for undeliverable results
// - GatewayError, the error taxonomy with stable codes
// - GenerationBackend and OutcomeStore, the two external collaborators
//
// Key design decisions:
// - No transport types leak in here; HTTP status mapping lives in the server crate
// - Principal and scopes live here because jobs and broadcast subscribers both carry them

pub mod backend;
pub mod dead_letter;
pub mod error;
pub mod job;
pub mod principal;
pub mod result;
pub mod store;

// Telemetry (tracing subscriber with optional OTLP export)
pub mod telemetry;

pub use backend::{BackendError, EchoBackend, GenerationBackend, GenerationOutput};
pub use dead_letter::{DeadLetterEntry, DeadLetterReason};
pub use error::{FieldError, GatewayError, Result};
pub use job::{Job, JobId};
pub use principal::{scopes, AuthMethod, Principal};
pub use result::{GenerationResult, JobOutcome, OutcomeRecord};
pub use store::{InMemoryOutcomeStore, OutcomeStore, StoreError};
