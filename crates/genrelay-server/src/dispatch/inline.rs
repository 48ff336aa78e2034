use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use genrelay_core::{GatewayError, Job};
use genrelay_worker::{PoolTask, WorkerPool, WorkerPoolError};

use super::{DeliveryMode, DispatchMode, Dispatched, Dispatcher};
use crate::correlator::Resolution;
use crate::metrics::GatewayMetrics;
use crate::sinks::OutcomeSinks;

/// Runs jobs on the local worker pool and answers synchronously
///
/// Never registers with the correlator. The in-flight count is the backlog.
pub struct InlineDispatcher {
    pool: Arc<WorkerPool>,
    sinks: OutcomeSinks,
    job_timeout: Duration,
    max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
}

/// Holds one in-flight slot and keeps the pending gauge in step with it
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
    metrics: Arc<GatewayMetrics>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let remaining = self.in_flight.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.metrics.set_pending_jobs(remaining);
    }
}

impl InlineDispatcher {
    pub fn new(
        pool: Arc<WorkerPool>,
        sinks: OutcomeSinks,
        job_timeout: Duration,
        max_in_flight: usize,
    ) -> Self {
        Self {
            pool,
            sinks,
            job_timeout,
            max_in_flight,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn admit(&self) -> Option<InFlightGuard> {
        let max = self.max_in_flight;
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|previous| {
                self.sinks.metrics.set_pending_jobs(previous + 1);
                InFlightGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    metrics: Arc::clone(&self.sinks.metrics),
                }
            })
    }
}

#[async_trait]
impl Dispatcher for InlineDispatcher {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Inline
    }

    async fn dispatch(&self, job: Job, _delivery: DeliveryMode) -> Result<Dispatched, GatewayError> {
        let Some(_guard) = self.admit() else {
            return Err(GatewayError::BacklogFull {
                limit: self.max_in_flight,
            });
        };

        let job_id = job.id;
        let task = PoolTask::new(job_id, job.request, job.state);

        let outcome = match tokio::time::timeout(self.job_timeout, self.pool.run(task)).await {
            Ok(Ok(done)) => {
                tracing::debug!(
                    job_id = %job_id,
                    slot = done.slot,
                    elapsed_ms = done.elapsed.as_millis() as u64,
                    "Inline job finished"
                );
                let result = done
                    .result
                    .map_err(|e| GatewayError::backend(e.to_string()));
                self.sinks.settle(job_id, result)
            }
            Ok(Err(WorkerPoolError::Saturated { limit })) => {
                return Err(GatewayError::BacklogFull { limit });
            }
            Ok(Err(e)) => return Err(GatewayError::unavailable(e.to_string())),
            Err(_) => {
                // The task keeps its slot until the backend returns; its result is discarded
                let timeout_ms = self.job_timeout.as_millis() as u64;
                Err(self.sinks.timed_out(job_id, timeout_ms))
            }
        };

        self.sinks.record(job_id, &outcome);
        Ok(Dispatched::Completed(Resolution { job_id, outcome }))
    }

    fn pending(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}
