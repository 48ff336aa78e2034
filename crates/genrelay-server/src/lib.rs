// Generation gateway server
//
// Accepts generation jobs over HTTP and WebSocket, dispatches them to a
// backend (through the broker or on the local worker pool), correlates
// results, and broadcasts successful frames to subscribers.
//
// Module map:
// - gateway: admission (scope, rate limit, validation) and dispatch
// - dispatch: brokered and inline strategies behind the Dispatcher trait
// - correlator: pending-job actor with timeouts, dedupe and orphan handling
// - bridge: embedded backend consuming the request topic
// - sinks, quality, dead_letter, outbox: what happens to settled outcomes
// - broadcast: adaptive-rate frame fan-out
// - readiness, metrics: operational surface
// - api, auth, openapi: HTTP and WebSocket interfaces

pub mod api;
pub mod app;
pub mod auth;
pub mod bridge;
pub mod broadcast;
pub mod config;
pub mod correlator;
pub mod dead_letter;
pub mod dispatch;
pub mod gateway;
pub mod metrics;
pub mod openapi;
pub mod outbox;
pub mod quality;
pub mod rate_limit;
pub mod readiness;
pub mod recent;
pub mod sinks;
pub mod validation;

pub use app::{AppState, Pipeline, PipelineDeps};
pub use config::{ConfigError, ServerConfig};
