use std::sync::Arc;

use async_trait::async_trait;
use genrelay_broker::{publish_json, topics, Broker};
use genrelay_core::{GatewayError, Job};
use tokio::sync::oneshot;

use super::{DeliveryMode, DispatchMode, Dispatched, Dispatcher};
use crate::correlator::{CorrelatorHandle, Waiter};

/// Publishes jobs to `generation.request`; results come back through the correlator
pub struct BrokeredDispatcher {
    broker: Arc<dyn Broker>,
    correlator: CorrelatorHandle,
}

impl BrokeredDispatcher {
    pub fn new(broker: Arc<dyn Broker>, correlator: CorrelatorHandle) -> Self {
        Self { broker, correlator }
    }
}

#[async_trait]
impl Dispatcher for BrokeredDispatcher {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Brokered
    }

    async fn dispatch(&self, job: Job, delivery: DeliveryMode) -> Result<Dispatched, GatewayError> {
        let job_id = job.id;
        let (waiter, receiver) = match delivery {
            DeliveryMode::Wait => {
                let (tx, rx) = oneshot::channel();
                (Waiter::Reply(tx), Some(rx))
            }
            DeliveryMode::Detached => (Waiter::Detached, None),
            DeliveryMode::Channel(tx) => (Waiter::Channel(tx), None),
        };

        // Register first so a fast result always finds its waiter
        self.correlator.register(job_id, waiter).await?;

        if let Err(e) = publish_json(self.broker.as_ref(), topics::REQUEST, &job).await {
            self.correlator.cancel(job_id);
            tracing::warn!(job_id = %job_id, error = %e, "Failed to publish job");
            return Err(GatewayError::unavailable(format!(
                "failed to publish job: {e}"
            )));
        }

        tracing::debug!(job_id = %job_id, "Published job");
        Ok(Dispatched::Pending { job_id, receiver })
    }

    fn pending(&self) -> usize {
        self.correlator.pending()
    }
}
