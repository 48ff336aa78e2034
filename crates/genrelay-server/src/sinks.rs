// Where settled outcomes go
//
// Shared by the correlator (brokered mode) and the inline dispatcher so both
// paths gate, broadcast, count and record outcomes the same way.

use std::sync::Arc;

use genrelay_core::{
    DeadLetterEntry, GatewayError, GenerationOutput, JobId, JobOutcome, OutcomeRecord,
    OutcomeStore,
};

use crate::broadcast::Broadcaster;
use crate::dead_letter::DeadLetterLog;
use crate::metrics::GatewayMetrics;
use crate::outbox::Outbox;
use crate::quality::QualityGate;

#[derive(Clone)]
pub struct OutcomeSinks {
    pub metrics: Arc<GatewayMetrics>,
    pub dead_letters: Arc<DeadLetterLog>,
    pub broadcaster: Arc<Broadcaster>,
    pub store: Arc<dyn OutcomeStore>,
    pub outbox: Outbox,
    pub quality_gate: QualityGate,
}

impl OutcomeSinks {
    /// Apply the quality gate, broadcast a success, count the resolution
    pub fn settle(
        &self,
        job_id: JobId,
        outcome: Result<GenerationOutput, GatewayError>,
    ) -> Result<GenerationOutput, GatewayError> {
        let outcome = self.quality_gate.apply(job_id, outcome, &self.outbox);
        match &outcome {
            Ok(output) => {
                self.broadcaster.push(job_id, output.payload.clone());
                self.metrics.job_resolved("succeeded");
            }
            Err(e) => self.metrics.job_resolved(e.code()),
        }
        outcome
    }

    /// A job that never produced a result in time
    pub fn timed_out(&self, job_id: JobId, timeout_ms: u64) -> GatewayError {
        self.dead_letters
            .record(DeadLetterEntry::timeout(job_id, timeout_ms));
        self.metrics.job_resolved("job_timeout");
        GatewayError::JobTimeout { job_id, timeout_ms }
    }

    /// Write the outcome to the store without blocking the caller
    pub fn record(&self, job_id: JobId, outcome: &Result<GenerationOutput, GatewayError>) {
        let store = Arc::clone(&self.store);
        let record = OutcomeRecord::new(job_id, JobOutcome::from(outcome));
        tokio::spawn(async move {
            if let Err(e) = store.record(record).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to record job outcome");
            }
        });
    }
}

#[cfg(test)]
impl OutcomeSinks {
    /// Sinks with fresh metrics, an in-memory store and default broadcast settings
    pub(crate) fn for_tests(
        outbox: Outbox,
        store: genrelay_core::InMemoryOutcomeStore,
        quality_gate: QualityGate,
    ) -> Self {
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        Self {
            dead_letters: Arc::new(DeadLetterLog::new(
                100,
                outbox.clone(),
                Arc::clone(&metrics),
            )),
            broadcaster: Arc::new(Broadcaster::new(
                crate::broadcast::BroadcastConfig::default(),
                Arc::clone(&metrics),
            )),
            store: Arc::new(store),
            metrics,
            outbox,
            quality_gate,
        }
    }
}
