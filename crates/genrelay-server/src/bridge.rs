// Embedded backend bridge
//
// In brokered mode with EMBEDDED_BACKEND=true the gateway also plays the
// backend: it consumes `generation.request`, runs jobs on the worker pool and
// publishes their results to `generation.result`.
//
// Decision: A job the pool cannot take stays unacked until a slot frees up, so the
// broker holds the backlog instead of the process
// Decision: Result publishing retries with jittered backoff; a result that never makes it
// ends as a timeout dead letter on the correlator side

use std::sync::Arc;
use std::time::Duration;

use genrelay_broker::{publish_json, topics, Broker, Delivery, Subscription};
use genrelay_core::{DeadLetterEntry, DeadLetterReason, GenerationResult, Job};
use genrelay_worker::{PoolEvents, PoolTask, TaskOutcome, WorkerPool, WorkerPoolError};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dead_letter::DeadLetterLog;

const PUBLISH_ATTEMPTS: u32 = 5;
const PUBLISH_BASE_DELAY: Duration = Duration::from_millis(50);

pub struct BackendBridge {
    broker: Arc<dyn Broker>,
    pool: Arc<WorkerPool>,
    dead_letters: Arc<DeadLetterLog>,
}

/// A decoded job the pool had no room for, with its unacked delivery
struct Parked {
    delivery: Delivery,
    task: PoolTask,
}

impl BackendBridge {
    pub fn new(
        broker: Arc<dyn Broker>,
        pool: Arc<WorkerPool>,
        dead_letters: Arc<DeadLetterLog>,
    ) -> Self {
        Self {
            broker,
            pool,
            dead_letters,
        }
    }

    pub fn spawn(
        self,
        requests: Subscription,
        events: PoolEvents,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(requests, events, cancel))
    }

    async fn run(
        self,
        mut requests: Subscription,
        mut events: PoolEvents,
        cancel: CancellationToken,
    ) {
        tracing::info!(topic = requests.topic(), "Backend bridge started");
        let mut parked: Option<Parked> = None;
        let mut requests_open = true;

        loop {
            let can_read = requests_open && parked.is_none() && self.pool.is_accepting();

            tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = events.recv() => match outcome {
                    Some(outcome) => {
                        self.publish_result(outcome, &cancel).await;
                        if let Some(waiting) = parked.take() {
                            parked = self.submit(waiting);
                        }
                    }
                    None => {
                        tracing::warn!("Worker pool stopped, backend bridge exiting");
                        break;
                    }
                },
                delivery = requests.next(), if can_read => match delivery {
                    Some(delivery) => {
                        parked = self.accept(delivery);
                    }
                    None => {
                        tracing::warn!("Request subscription closed");
                        requests_open = false;
                    }
                },
            }
        }

        if let Some(waiting) = parked {
            waiting.delivery.nack();
        }
        tracing::info!("Backend bridge stopped");
    }

    /// Decode a request delivery and hand it to the pool
    fn accept(&self, delivery: Delivery) -> Option<Parked> {
        let job: Job = match serde_json::from_slice(delivery.payload()) {
            Ok(job) => job,
            Err(e) => {
                self.dead_letters.record(
                    DeadLetterEntry::new(DeadLetterReason::ProcessingError)
                        .with_raw(serde_json::Value::String(
                            String::from_utf8_lossy(delivery.payload()).into_owned(),
                        ))
                        .with_detail(format!("malformed job: {e}")),
                );
                delivery.ack();
                return None;
            }
        };

        tracing::debug!(job_id = %job.id, principal = %job.auth_principal, "Received job");
        self.submit(Parked {
            delivery,
            task: PoolTask::new(job.id, job.request, job.state),
        })
    }

    fn submit(&self, parked: Parked) -> Option<Parked> {
        match self.pool.enqueue(parked.task.clone()) {
            Ok(()) => {
                parked.delivery.ack();
                None
            }
            Err(WorkerPoolError::Saturated { limit }) => {
                tracing::debug!(job_id = %parked.task.key, limit, "Pool saturated, holding job");
                Some(parked)
            }
            Err(e) => {
                tracing::warn!(job_id = %parked.task.key, error = %e, "Pool refused job");
                parked.delivery.nack();
                None
            }
        }
    }

    async fn publish_result(&self, outcome: TaskOutcome, cancel: &CancellationToken) {
        let job_id = outcome.key;
        let result = GenerationResult::from_backend(job_id, outcome.result);

        for attempt in 1..=PUBLISH_ATTEMPTS {
            match publish_json(self.broker.as_ref(), topics::RESULT, &result).await {
                Ok(()) => return,
                Err(e) if attempt == PUBLISH_ATTEMPTS => {
                    tracing::error!(
                        job_id = %job_id,
                        error = %e,
                        attempts = attempt,
                        "Giving up publishing result"
                    );
                }
                Err(e) => {
                    let delay = backoff(attempt);
                    tracing::warn!(
                        job_id = %job_id,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to publish result, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Exponential backoff with up to 50% jitter
fn backoff(attempt: u32) -> Duration {
    let base = PUBLISH_BASE_DELAY.as_millis() as u64 * 2u64.pow(attempt.saturating_sub(1));
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::GatewayMetrics;
    use crate::outbox::Outbox;
    use genrelay_broker::InMemoryBroker;
    use genrelay_core::{EchoBackend, JobId};
    use genrelay_worker::{NoopBinder, OverflowConfig, WorkerPoolConfig};
    use serde_json::json;

    struct Setup {
        broker: InMemoryBroker,
        dead_letters: Arc<DeadLetterLog>,
        results: Subscription,
        cancel: CancellationToken,
    }

    async fn setup(pool_config: WorkerPoolConfig, backend: EchoBackend) -> Setup {
        let broker = InMemoryBroker::new();
        let (pool, events) =
            WorkerPool::start(pool_config, Arc::new(backend), Arc::new(NoopBinder)).unwrap();
        let dead_letters = Arc::new(DeadLetterLog::new(
            10,
            Outbox::disabled(),
            Arc::new(GatewayMetrics::new().unwrap()),
        ));
        let cancel = CancellationToken::new();
        let requests = broker.subscribe(topics::REQUEST).await.unwrap();
        let results = broker.subscribe(topics::RESULT).await.unwrap();

        BackendBridge::new(
            Arc::new(broker.clone()),
            Arc::new(pool),
            Arc::clone(&dead_letters),
        )
        .spawn(requests, events, cancel.clone());

        Setup {
            broker,
            dead_letters,
            results,
            cancel,
        }
    }

    async fn next_result(results: &mut Subscription) -> GenerationResult {
        let delivery = tokio::time::timeout(Duration::from_secs(5), results.next())
            .await
            .unwrap()
            .unwrap();
        let result = serde_json::from_slice(delivery.payload()).unwrap();
        delivery.ack();
        result
    }

    #[test]
    fn test_backoff_grows() {
        let first = backoff(1);
        let third = backoff(3);
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(75));
        assert!(third >= Duration::from_millis(200) && third <= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_job_round_trip() {
        let mut s = setup(WorkerPoolConfig::default(), EchoBackend::new()).await;
        let job = Job::new(json!({"type": "manual"}), json!({"n": 1}), "svc");

        publish_json(&s.broker, topics::REQUEST, &job).await.unwrap();
        let result = next_result(&mut s.results).await;

        assert_eq!(result.job_id, Some(job.id));
        assert!(result.success);
        assert_eq!(result.payload.unwrap()["state"]["n"], 1);
        s.cancel.cancel();
    }

    #[tokio::test]
    async fn test_malformed_job_is_dead_lettered() {
        let s = setup(WorkerPoolConfig::default(), EchoBackend::new()).await;
        s.broker
            .publish(topics::REQUEST, b"{\"id\": 42}".to_vec())
            .await
            .unwrap();

        for _ in 0..100 {
            if !s.dead_letters.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let entries = s.dead_letters.recent(1);
        assert_eq!(entries[0].reason, DeadLetterReason::ProcessingError);
        assert_eq!(s.broker.depth(topics::REQUEST), 0);
        s.cancel.cancel();
    }

    #[tokio::test]
    async fn test_saturated_pool_leaves_jobs_on_the_broker() {
        let config = WorkerPoolConfig::default()
            .with_size(1)
            .with_overflow(OverflowConfig::default().with_capacity(1));
        let backend = EchoBackend::new().with_delay(Duration::from_millis(100));
        let mut s = setup(config, backend).await;

        let jobs: Vec<Job> = (0..5)
            .map(|i| Job::new(json!({"i": i}), json!({}), "svc"))
            .collect();
        for job in &jobs {
            publish_json(&s.broker, topics::REQUEST, job).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        // One running and one queued; the rest wait on the broker
        assert!(s.broker.depth(topics::REQUEST) >= 2);

        let mut seen = Vec::new();
        for _ in 0..jobs.len() {
            seen.push(next_result(&mut s.results).await.job_id.unwrap());
        }
        let expected: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(seen, expected);
        s.cancel.cancel();
    }
}
