// Result correlator
//
// Single-task actor owning every pending registration, the processed-job set
// and the per-job timeout timers. Nothing else touches that state; callers go
// through CorrelatorHandle commands.
//
// Lifecycle of a registration:
//   pending ──result──► resolved
//           ──timer───► timed_out (one `timeout` dead letter)
//           ──cancel──► cancelled (publish failed, nothing recorded)
//
// Results are consumed one delivery at a time and acked after handling,
// whatever the handling concluded.
//
// Decision: Backlog admission happens in the same actor step as insertion
// Decision: Orphaned job ids enter the processed set so redeliveries are silent

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use genrelay_broker::{Delivery, Subscription};
use genrelay_core::{
    DeadLetterEntry, DeadLetterReason, GatewayError, GenerationOutput, GenerationResult, JobId,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};

use crate::recent::RecentSet;
use crate::sinks::OutcomeSinks;

/// Longest accepted job deadline
pub const MAX_JOB_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Correlator limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatorConfig {
    pub job_timeout: Duration,
    pub max_pending: usize,
    pub processed_capacity: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_millis(30_000),
            max_pending: 1000,
            processed_capacity: 2000,
        }
    }
}

impl CorrelatorConfig {
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    pub fn with_processed_capacity(mut self, capacity: usize) -> Self {
        self.processed_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.job_timeout.is_zero() {
            return Err("job timeout must be greater than zero".to_string());
        }
        if self.job_timeout > MAX_JOB_TIMEOUT {
            return Err(format!(
                "job timeout must be at most {}ms",
                MAX_JOB_TIMEOUT.as_millis()
            ));
        }
        Ok(())
    }
}

/// The settled outcome of one job, as handed to its waiter
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub job_id: JobId,
    pub outcome: Result<GenerationOutput, GatewayError>,
}

/// Who receives a job's outcome
#[derive(Debug)]
pub enum Waiter {
    /// A single caller awaiting this job (HTTP wait mode)
    Reply(oneshot::Sender<Resolution>),
    /// A socket session multiplexing several jobs
    Channel(mpsc::UnboundedSender<Resolution>),
    /// Nobody waits; the outcome goes to the store
    Detached,
}

struct PendingEntry {
    waiter: Waiter,
    timer: delay_queue::Key,
    registered_at: DateTime<Utc>,
}

enum Command {
    Register {
        job_id: JobId,
        waiter: Waiter,
        ack: oneshot::Sender<Result<(), GatewayError>>,
    },
    Cancel {
        job_id: JobId,
    },
}

/// Cheap handle to the correlator actor
#[derive(Clone)]
pub struct CorrelatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
}

impl CorrelatorHandle {
    /// Admit and register a job, or fail with `backlog_full`
    pub async fn register(&self, job_id: JobId, waiter: Waiter) -> Result<(), GatewayError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(Command::Register { job_id, waiter, ack })
            .map_err(|_| GatewayError::unavailable("result correlator is not running"))?;
        rx.await
            .map_err(|_| GatewayError::unavailable("result correlator is not running"))?
    }

    /// Drop a registration without recording anything
    pub fn cancel(&self, job_id: JobId) {
        let _ = self.commands.send(Command::Cancel { job_id });
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }
}

pub struct Correlator {
    config: CorrelatorConfig,
    pending: HashMap<JobId, PendingEntry>,
    timers: DelayQueue<JobId>,
    processed: RecentSet<JobId>,
    pending_count: Arc<AtomicUsize>,
    sinks: OutcomeSinks,
}

impl Correlator {
    /// Start the actor consuming `results` until `cancel` fires
    pub fn spawn(
        config: CorrelatorConfig,
        sinks: OutcomeSinks,
        results: Subscription,
        cancel: CancellationToken,
    ) -> (CorrelatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending_count = Arc::new(AtomicUsize::new(0));
        let handle = CorrelatorHandle {
            commands: tx,
            pending: Arc::clone(&pending_count),
            max_pending: config.max_pending,
        };

        let correlator = Correlator {
            processed: RecentSet::new(config.processed_capacity),
            config,
            pending: HashMap::new(),
            timers: DelayQueue::new(),
            pending_count,
            sinks,
        };
        let task = tokio::spawn(correlator.run(rx, results, cancel));
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut results: Subscription,
        cancel: CancellationToken,
    ) {
        tracing::info!(
            topic = results.topic(),
            job_timeout_ms = self.config.job_timeout.as_millis() as u64,
            max_pending = self.config.max_pending,
            "Result correlator started"
        );
        let mut results_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.on_command(command),
                delivery = results.next(), if results_open => match delivery {
                    Some(delivery) => self.on_delivery(delivery),
                    None => {
                        tracing::warn!("Result subscription closed");
                        results_open = false;
                    }
                },
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    self.on_timeout(expired.into_inner());
                }
            }
        }

        self.fail_remaining();
        tracing::info!("Result correlator stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Register { job_id, waiter, ack } => {
                if self.pending.len() >= self.config.max_pending {
                    let _ = ack.send(Err(GatewayError::BacklogFull {
                        limit: self.config.max_pending,
                    }));
                    return;
                }
                // DelayQueue panics on deadlines past its wheel horizon
                let timeout = self.config.job_timeout.min(MAX_JOB_TIMEOUT);
                let timer = self.timers.insert(job_id, timeout);
                self.pending.insert(
                    job_id,
                    PendingEntry {
                        waiter,
                        timer,
                        registered_at: Utc::now(),
                    },
                );
                self.sync_pending();
                tracing::debug!(job_id = %job_id, "Registered pending job");
                let _ = ack.send(Ok(()));
            }
            Command::Cancel { job_id } => {
                if let Some(entry) = self.pending.remove(&job_id) {
                    self.timers.try_remove(&entry.timer);
                    self.sync_pending();
                    tracing::debug!(job_id = %job_id, "Cancelled pending job");
                }
            }
        }
    }

    fn on_delivery(&mut self, delivery: Delivery) {
        let handled = catch_unwind(AssertUnwindSafe(|| self.handle_result(delivery.payload())));
        if let Err(panic) = handled {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            self.sinks.dead_letters.record(
                DeadLetterEntry::new(DeadLetterReason::ProcessingError)
                    .with_raw(raw_value(delivery.payload()))
                    .with_detail(format!("panic while handling result: {detail}")),
            );
        }
        delivery.ack();
    }

    fn handle_result(&mut self, payload: &[u8]) {
        let raw: Value = match serde_json::from_slice(payload) {
            Ok(raw) => raw,
            Err(e) => {
                self.sinks.dead_letters.record(
                    DeadLetterEntry::new(DeadLetterReason::ProcessingError)
                        .with_raw(raw_value(payload))
                        .with_detail(format!("result is not JSON: {e}")),
                );
                return;
            }
        };

        if raw.get("jobId").map_or(true, is_blank_id) {
            self.sinks
                .dead_letters
                .record(DeadLetterEntry::new(DeadLetterReason::MissingJobId).with_raw(raw));
            return;
        }

        let result: GenerationResult = match serde_json::from_value(raw.clone()) {
            Ok(result) => result,
            Err(e) => {
                self.sinks.dead_letters.record(
                    DeadLetterEntry::new(DeadLetterReason::ProcessingError)
                        .with_raw(raw)
                        .with_detail(format!("malformed result: {e}")),
                );
                return;
            }
        };
        let Some(job_id) = result.job_id else {
            self.sinks
                .dead_letters
                .record(DeadLetterEntry::new(DeadLetterReason::MissingJobId).with_raw(raw));
            return;
        };

        if self.processed.contains(&job_id) {
            tracing::debug!(job_id = %job_id, "Discarding duplicate result");
            self.sinks.metrics.duplicate_result();
            return;
        }
        self.processed.insert(job_id);

        let Some(entry) = self.pending.remove(&job_id) else {
            self.sinks
                .dead_letters
                .record(DeadLetterEntry::orphan(job_id, raw));
            return;
        };
        self.timers.try_remove(&entry.timer);
        self.sync_pending();

        let outcome = self.sinks.settle(job_id, result.into_outcome());
        tracing::debug!(
            job_id = %job_id,
            success = outcome.is_ok(),
            waited_ms = (Utc::now() - entry.registered_at).num_milliseconds(),
            "Resolved job"
        );
        self.deliver(job_id, entry.waiter, outcome);
    }

    fn on_timeout(&mut self, job_id: JobId) {
        // Already resolved or cancelled
        let Some(entry) = self.pending.remove(&job_id) else {
            return;
        };
        self.sync_pending();
        let timeout_ms = self.config.job_timeout.as_millis() as u64;
        let error = self.sinks.timed_out(job_id, timeout_ms);
        self.deliver(job_id, entry.waiter, Err(error));
    }

    fn deliver(
        &self,
        job_id: JobId,
        waiter: Waiter,
        outcome: Result<GenerationOutput, GatewayError>,
    ) {
        match waiter {
            Waiter::Reply(tx) => {
                if tx.send(Resolution { job_id, outcome }).is_err() {
                    tracing::debug!(job_id = %job_id, "Waiter went away before resolution");
                }
            }
            Waiter::Channel(tx) => {
                if tx.send(Resolution { job_id, outcome }).is_err() {
                    tracing::debug!(job_id = %job_id, "Session closed before resolution");
                }
            }
            Waiter::Detached => self.sinks.record(job_id, &outcome),
        }
    }

    fn fail_remaining(&mut self) {
        let remaining: Vec<(JobId, PendingEntry)> = self.pending.drain().collect();
        if !remaining.is_empty() {
            tracing::warn!(count = remaining.len(), "Failing pending jobs on shutdown");
        }
        for (job_id, entry) in remaining {
            self.deliver(
                job_id,
                entry.waiter,
                Err(GatewayError::unavailable("gateway is shutting down")),
            );
        }
        self.timers.clear();
        self.sync_pending();
    }

    fn sync_pending(&self) {
        self.pending_count
            .store(self.pending.len(), Ordering::Release);
        self.sinks.metrics.set_pending_jobs(self.pending.len());
    }
}

/// `null` and empty strings count as a missing id
fn is_blank_id(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn raw_value(payload: &[u8]) -> Value {
    Value::String(String::from_utf8_lossy(payload).into_owned())
}
