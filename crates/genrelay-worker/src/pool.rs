//! Worker pool for generation tasks
//!
//! A fixed set of OS threads runs the backend. One scheduler task owns the
//! slot table and the overflow queue; nothing else mutates them.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle as ThreadHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use genrelay_core::{BackendError, GenerationBackend, GenerationOutput, JobId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::affinity::CoreBinder;
use super::backpressure::{BackpressureState, OverflowConfig};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of worker threads (dedicated cores)
    pub size: usize,

    /// Overflow queue configuration
    pub overflow: OverflowConfig,

    /// Worker threads are named `{prefix}-{slot}`
    pub thread_name_prefix: String,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            size: 2,
            overflow: OverflowConfig::default(),
            thread_name_prefix: "genrelay-worker".to_string(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Set the number of worker threads
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    /// Set overflow queue configuration
    pub fn with_overflow(mut self, config: OverflowConfig) -> Self {
        self.overflow = config;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), WorkerPoolError> {
        if self.size == 0 {
            return Err(WorkerPoolError::InvalidConfig(
                "pool size must be at least 1".into(),
            ));
        }
        self.overflow
            .validate()
            .map_err(|e| WorkerPoolError::InvalidConfig(e.to_string()))
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolStatus {
    /// Threads are being spawned
    Starting,
    /// Accepting tasks
    Running,
    /// Finishing queued tasks, not accepting new ones
    Draining,
    /// All workers have exited
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// A worker thread could not be spawned (fatal at startup)
    #[error("failed to spawn worker thread {slot}: {source}")]
    Spawn {
        slot: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid worker pool configuration: {0}")]
    InvalidConfig(String),

    /// Pool must be started from inside a tokio runtime
    #[error("worker pool requires a running tokio runtime")]
    NoRuntime,

    /// Every slot is busy and the overflow queue is full
    #[error("worker pool is saturated ({limit} tasks outstanding)")]
    Saturated { limit: usize },

    /// Pool is draining or stopped
    #[error("worker pool is not running")]
    NotRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Work handed to a worker thread
#[derive(Debug, Clone)]
pub struct PoolTask {
    /// Correlation key carried through to the outcome
    pub key: JobId,
    pub request: Value,
    pub state: Value,
}

impl PoolTask {
    pub fn new(key: JobId, request: Value, state: Value) -> Self {
        Self {
            key,
            request,
            state,
        }
    }
}

/// Completed task, successful or not
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub key: JobId,
    /// Slot that ran the task
    pub slot: usize,
    pub result: Result<GenerationOutput, BackendError>,
    pub elapsed: Duration,
}

/// Scheduler view of one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSlot {
    pub id: usize,
    pub busy: bool,
    pub last_activity_at: DateTime<Utc>,
}

/// Point-in-time pool state, published by the scheduler
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub size: usize,
    pub busy: usize,
    pub queued: usize,
    /// Number of hand-offs to a worker since start
    pub cycles: u64,
    pub completed: u64,
    pub failed: u64,
    pub slots: Vec<WorkerSlot>,
}

/// Outcomes of tasks submitted with [`WorkerPool::enqueue`]
pub struct PoolEvents {
    rx: mpsc::UnboundedReceiver<TaskOutcome>,
}

impl PoolEvents {
    /// Wait for the next outcome. `None` once the pool has stopped.
    pub async fn recv(&mut self) -> Option<TaskOutcome> {
        self.rx.recv().await
    }
}

struct Envelope {
    task: PoolTask,
    reply: Option<oneshot::Sender<TaskOutcome>>,
}

struct Completion {
    slot: usize,
    key: JobId,
    result: Result<GenerationOutput, BackendError>,
    elapsed: Duration,
}

/// Fixed-size pool of pinned worker threads
///
/// # Example
///
/// ```ignore
/// let (pool, mut events) = WorkerPool::start(config, backend, Arc::new(NoopBinder))?;
/// let outcome = pool.run(PoolTask::new(job.id, job.request, job.state)).await?;
/// ```
pub struct WorkerPool {
    config: WorkerPoolConfig,
    commands: mpsc::UnboundedSender<Envelope>,
    backpressure: Arc<BackpressureState>,
    snapshot_rx: watch::Receiver<PoolSnapshot>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    threads: Mutex<Vec<ThreadHandle<()>>>,
}

impl WorkerPool {
    /// Spawn the worker threads and the scheduler
    ///
    /// Must be called from within a tokio runtime. Spawn failures are fatal.
    pub fn start(
        config: WorkerPoolConfig,
        backend: Arc<dyn GenerationBackend>,
        binder: Arc<dyn CoreBinder>,
    ) -> Result<(Self, PoolEvents), WorkerPoolError> {
        config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| WorkerPoolError::NoRuntime)?;

        info!(
            size = config.size,
            overflow_capacity = config.overflow.capacity,
            backend = backend.name(),
            "Starting worker pool"
        );

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(config.size);
        let mut threads = Vec::with_capacity(config.size);

        for slot in 0..config.size {
            let (work_tx, work_rx) = mpsc::unbounded_channel();
            let backend = Arc::clone(&backend);
            let binder = Arc::clone(&binder);
            let done = completion_tx.clone();

            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, slot))
                .spawn(move || worker_loop(slot, backend, binder, work_rx, done))
                .map_err(|source| WorkerPoolError::Spawn { slot, source })?;

            workers.push(work_tx);
            threads.push(handle);
        }
        drop(completion_tx);

        let backpressure = Arc::new(BackpressureState::new(
            config.overflow.clone(),
            config.size,
        ));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let now = Utc::now();
        let slots: Vec<WorkerSlot> = (0..config.size)
            .map(|id| WorkerSlot {
                id,
                busy: false,
                last_activity_at: now,
            })
            .collect();
        let scheduler = Scheduler {
            in_flight: (0..config.size).map(|_| None).collect(),
            slots,
            workers,
            overflow: VecDeque::new(),
            cycles: 0,
            completed: 0,
            failed: 0,
            backpressure: Arc::clone(&backpressure),
            events: event_tx,
            snapshot: watch::Sender::new(PoolSnapshot::default()),
        };
        scheduler.publish();
        let snapshot_rx = scheduler.snapshot.subscribe();

        let handle = runtime.spawn(scheduler.run(command_rx, completion_rx, shutdown_rx));

        let pool = Self {
            config,
            commands: command_tx,
            backpressure,
            snapshot_rx,
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Starting),
            scheduler: Mutex::new(Some(handle)),
            threads: Mutex::new(threads),
        };
        *pool.status.write() = WorkerPoolStatus::Running;

        Ok((pool, PoolEvents { rx: event_rx }))
    }

    /// Submit a task; its outcome arrives on [`PoolEvents`]
    pub fn enqueue(&self, task: PoolTask) -> Result<(), WorkerPoolError> {
        self.submit(task, None)
    }

    /// Submit a task and wait for its own outcome
    pub async fn run(&self, task: PoolTask) -> Result<TaskOutcome, WorkerPoolError> {
        let (tx, rx) = oneshot::channel();
        self.submit(task, Some(tx))?;
        rx.await.map_err(|_| WorkerPoolError::NotRunning)
    }

    fn submit(
        &self,
        task: PoolTask,
        reply: Option<oneshot::Sender<TaskOutcome>>,
    ) -> Result<(), WorkerPoolError> {
        if self.status() != WorkerPoolStatus::Running {
            return Err(WorkerPoolError::NotRunning);
        }
        if !self.backpressure.try_admit() {
            debug!(
                job_id = %task.key,
                reason = ?self.backpressure.backpressure_reason(),
                "Worker pool rejected task"
            );
            return Err(WorkerPoolError::Saturated {
                limit: self.backpressure.limit(),
            });
        }
        if self.commands.send(Envelope { task, reply }).is_err() {
            self.backpressure.task_completed();
            return Err(WorkerPoolError::NotRunning);
        }
        Ok(())
    }

    /// Whether upstream should keep sending work
    ///
    /// Re-evaluates the watermarks, so a paused pool reports ready again once
    /// its queue drained below the low watermark.
    pub fn is_accepting(&self) -> bool {
        self.status() == WorkerPoolStatus::Running && self.backpressure.should_accept()
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn size(&self) -> usize {
        self.config.size
    }

    /// Latest state published by the scheduler
    pub fn snapshot(&self) -> PoolSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receive every snapshot change (for gauges)
    pub fn watch_snapshots(&self) -> watch::Receiver<PoolSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Drain queued work, then stop the workers
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!("Initiating worker pool drain");
        self.backpressure.pause("shutting down");
        let _ = self.shutdown_tx.send(true);

        let scheduler = self.scheduler.lock().take();
        if let Some(handle) = scheduler {
            if tokio::time::timeout(self.config.shutdown_timeout, handle)
                .await
                .is_err()
            {
                warn!(
                    queued = self.backpressure.queue_depth(),
                    "Worker pool shutdown timeout reached"
                );
                *self.status.write() = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout);
            }
        }

        // The scheduler dropped the work senders; threads exit after their current task
        let threads = std::mem::take(&mut *self.threads.lock());
        let _ = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let _ = thread.join();
            }
        })
        .await;

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!("Worker pool stopped");
        Ok(())
    }
}

struct Scheduler {
    slots: Vec<WorkerSlot>,
    workers: Vec<mpsc::UnboundedSender<PoolTask>>,
    in_flight: Vec<Option<oneshot::Sender<TaskOutcome>>>,
    overflow: VecDeque<Envelope>,
    cycles: u64,
    completed: u64,
    failed: u64,
    backpressure: Arc<BackpressureState>,
    events: mpsc::UnboundedSender<TaskOutcome>,
    snapshot: watch::Sender<PoolSnapshot>,
}

impl Scheduler {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Envelope>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut draining = false;

        loop {
            if draining && self.is_idle() {
                break;
            }

            tokio::select! {
                Some(completion) = completions.recv() => self.complete(completion),
                command = commands.recv(), if !draining => match command {
                    Some(envelope) => self.submit(envelope),
                    None => draining = true,
                },
                changed = shutdown.changed(), if !draining => {
                    if changed.is_err() || *shutdown.borrow() {
                        // Tasks admitted before the drain started still run
                        while let Ok(envelope) = commands.try_recv() {
                            self.submit(envelope);
                        }
                        debug!(queued = self.overflow.len(), "Scheduler: shutdown requested");
                        draining = true;
                    }
                }
                else => break,
            }
        }

        debug!(cycles = self.cycles, "Scheduler exited");
    }

    fn is_idle(&self) -> bool {
        self.overflow.is_empty() && self.slots.iter().all(|s| !s.busy)
    }

    fn submit(&mut self, envelope: Envelope) {
        match self.slots.iter().position(|s| !s.busy) {
            Some(slot) => self.dispatch(slot, envelope),
            None => {
                self.overflow.push_back(envelope);
                self.backpressure.set_queue_depth(self.overflow.len());
            }
        }
        self.publish();
    }

    fn dispatch(&mut self, slot: usize, envelope: Envelope) {
        let Envelope { task, reply } = envelope;
        let key = task.key;

        self.slots[slot].busy = true;
        self.slots[slot].last_activity_at = Utc::now();
        self.cycles += 1;

        if self.workers[slot].send(task).is_err() {
            error!(slot, job_id = %key, "Worker thread unavailable, failing task");
            self.slots[slot].busy = false;
            self.failed += 1;
            self.backpressure.task_completed();
            let outcome = TaskOutcome {
                key,
                slot,
                result: Err(BackendError::new("worker thread unavailable")),
                elapsed: Duration::ZERO,
            };
            self.route(outcome, reply);
            return;
        }
        self.in_flight[slot] = reply;
    }

    fn complete(&mut self, completion: Completion) {
        let Completion {
            slot,
            key,
            result,
            elapsed,
        } = completion;

        let Some(state) = self.slots.get_mut(slot) else {
            warn!(slot, "Completion from unknown slot");
            return;
        };
        state.busy = false;
        state.last_activity_at = Utc::now();

        if result.is_ok() {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.backpressure.task_completed();
        let reply = self.in_flight[slot].take();

        if let Some(next) = self.overflow.pop_front() {
            self.backpressure.set_queue_depth(self.overflow.len());
            self.dispatch(slot, next);
        }
        self.publish();

        self.route(
            TaskOutcome {
                key,
                slot,
                result,
                elapsed,
            },
            reply,
        );
    }

    fn route(&self, outcome: TaskOutcome, reply: Option<oneshot::Sender<TaskOutcome>>) {
        match reply {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!("Task waiter gone, dropping outcome");
                }
            }
            None => {
                if self.events.send(outcome).is_err() {
                    debug!("No pool event consumer, dropping outcome");
                }
            }
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(PoolSnapshot {
            size: self.slots.len(),
            busy: self.slots.iter().filter(|s| s.busy).count(),
            queued: self.overflow.len(),
            cycles: self.cycles,
            completed: self.completed,
            failed: self.failed,
            slots: self.slots.clone(),
        });
    }
}

fn worker_loop(
    slot: usize,
    backend: Arc<dyn GenerationBackend>,
    binder: Arc<dyn CoreBinder>,
    mut tasks: mpsc::UnboundedReceiver<PoolTask>,
    done: mpsc::UnboundedSender<Completion>,
) {
    match binder.bind(slot) {
        Ok(Some(core)) => debug!(slot, core, "Worker pinned to core"),
        Ok(None) => debug!(slot, "Worker running unpinned"),
        Err(e) => warn!(slot, error = %e, "CPU pinning failed, continuing unpinned"),
    }

    while let Some(task) = tasks.blocking_recv() {
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| {
            backend.generate(&task.request, &task.state)
        }))
        .unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            error!(slot, job_id = %task.key, panic = %message, "Backend panicked");
            Err(BackendError::new(format!("backend panicked: {message}")))
        });

        let completion = Completion {
            slot,
            key: task.key,
            result,
            elapsed: started.elapsed(),
        };
        if done.send(completion).is_err() {
            break;
        }
    }

    debug!(slot, "Worker thread exiting");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
