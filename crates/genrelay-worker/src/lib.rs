//! Worker pool for CPU-bound generation
//!
//! This crate provides:
//! - [`WorkerPool`] - fixed-size pool of pinned worker threads
//! - [`OverflowConfig`] - overflow queue cap and backpressure watermarks
//! - [`CoreBinder`] - best-effort CPU affinity behind a trait
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         WorkerPool                            │
//! │  enqueue/run ──► BackpressureState (atomic admission)         │
//! │         │                                                     │
//! │         ▼                                                     │
//! │  ┌────────────────────────────────────────────────────┐      │
//! │  │ Scheduler task (owns WorkerSlots + overflow queue) │      │
//! │  └──────┬──────────────┬──────────────┬───────────────┘      │
//! │         │ mpsc         │ mpsc         │ mpsc                  │
//! │         ▼              ▼              ▼                       │
//! │   [worker-0]      [worker-1]     [worker-N]   (OS threads,    │
//! │    core 0          core 1         core N       pinned)        │
//! │         │              │              │                       │
//! │         └──────────────┴──────┬───────┘                       │
//! │                               ▼ completions                   │
//! │                    Scheduler ──► PoolEvents / reply           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use genrelay_worker::{NoopBinder, PoolTask, WorkerPool, WorkerPoolConfig};
//!
//! let (pool, mut events) = WorkerPool::start(
//!     WorkerPoolConfig::default().with_size(4),
//!     Arc::new(EchoBackend::new()),
//!     Arc::new(NoopBinder),
//! )?;
//!
//! pool.enqueue(PoolTask::new(job.id, job.request, job.state))?;
//! let outcome = events.recv().await;
//!
//! pool.shutdown().await?;
//! ```

mod affinity;
mod backpressure;
mod pool;

pub use affinity::{AffinityError, CoreAffinityBinder, CoreBinder, NoopBinder};
pub use backpressure::{BackpressureError, BackpressureState, OverflowConfig};
pub use pool::{
    PoolEvents, PoolSnapshot, PoolTask, TaskOutcome, WorkerPool, WorkerPoolConfig,
    WorkerPoolError, WorkerPoolStatus, WorkerSlot,
};
