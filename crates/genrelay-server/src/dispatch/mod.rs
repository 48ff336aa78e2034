// Job dispatch strategies
//
// Brokered: register with the correlator, publish to `generation.request`,
// and let the result topic resolve the waiter.
// Inline: run the job on the local worker pool and answer synchronously.
//
// Decision: The strategy is chosen once at startup from DISPATCH_MODE

mod brokered;
mod inline;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use genrelay_broker::Broker;
use genrelay_core::{GatewayError, Job, JobId};
use genrelay_worker::WorkerPool;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use utoipa::ToSchema;

use crate::correlator::{CorrelatorHandle, Resolution};
use crate::sinks::OutcomeSinks;

pub use brokered::BrokeredDispatcher;
pub use inline::InlineDispatcher;

/// How jobs reach the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    #[default]
    Brokered,
    Inline,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Brokered => "brokered",
            DispatchMode::Inline => "inline",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "brokered" | "broker" => Ok(DispatchMode::Brokered),
            "inline" | "local" => Ok(DispatchMode::Inline),
            other => Err(format!(
                "unknown dispatch mode '{other}', expected brokered or inline"
            )),
        }
    }
}

/// Where the caller wants the outcome
#[derive(Debug)]
pub enum DeliveryMode {
    /// Hand back a receiver for this job's outcome
    Wait,
    /// Record the outcome in the store; nobody waits
    Detached,
    /// Send the outcome to a session's resolution channel
    Channel(mpsc::UnboundedSender<Resolution>),
}

impl DeliveryMode {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryMode::Wait => "wait",
            DeliveryMode::Detached => "async",
            DeliveryMode::Channel(_) => "socket",
        }
    }
}

/// Result of an accepted submission
#[derive(Debug)]
pub enum Dispatched {
    /// Accepted; the outcome arrives later (receiver present in wait mode)
    Pending {
        job_id: JobId,
        receiver: Option<oneshot::Receiver<Resolution>>,
    },
    /// Already settled
    Completed(Resolution),
}

impl Dispatched {
    pub fn job_id(&self) -> JobId {
        match self {
            Dispatched::Pending { job_id, .. } => *job_id,
            Dispatched::Completed(resolution) => resolution.job_id,
        }
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn mode(&self) -> DispatchMode;

    /// Hand a validated job to the backend
    ///
    /// Fails with `backlog_full` or `dependency_unavailable` when the job
    /// cannot be accepted; once accepted, failures arrive as the outcome.
    async fn dispatch(&self, job: Job, delivery: DeliveryMode) -> Result<Dispatched, GatewayError>;

    /// Jobs accepted but not yet settled
    fn pending(&self) -> usize;
}

/// What a dispatcher needs, per mode
pub enum DispatchBackend {
    Brokered {
        broker: Arc<dyn Broker>,
        correlator: CorrelatorHandle,
    },
    Inline {
        pool: Arc<WorkerPool>,
        sinks: OutcomeSinks,
        job_timeout: Duration,
        max_in_flight: usize,
    },
}

pub fn create_dispatcher(backend: DispatchBackend) -> Arc<dyn Dispatcher> {
    match backend {
        DispatchBackend::Brokered { broker, correlator } => {
            Arc::new(BrokeredDispatcher::new(broker, correlator))
        }
        DispatchBackend::Inline {
            pool,
            sinks,
            job_timeout,
            max_in_flight,
        } => Arc::new(InlineDispatcher::new(pool, sinks, job_timeout, max_in_flight)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_mode_from_str() {
        assert_eq!("brokered".parse::<DispatchMode>(), Ok(DispatchMode::Brokered));
        assert_eq!("INLINE".parse::<DispatchMode>(), Ok(DispatchMode::Inline));
        assert!("kafka".parse::<DispatchMode>().is_err());
        assert_eq!(DispatchMode::default().to_string(), "brokered");
    }

    #[test]
    fn test_delivery_labels() {
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(DeliveryMode::Wait.label(), "wait");
        assert_eq!(DeliveryMode::Detached.label(), "async");
        assert_eq!(DeliveryMode::Channel(tx).label(), "socket");
    }
}
