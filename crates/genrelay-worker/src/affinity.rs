//! CPU affinity for worker threads
//!
//! Pinning is best-effort: a binder that fails only costs cache locality,
//! so callers log the error and keep running.

use core_affinity::CoreId;
use thiserror::Error;

/// Affinity errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AffinityError {
    /// Platform exposes no core ids
    #[error("CPU affinity is not supported on this platform")]
    Unsupported,

    /// The OS refused the pinning call
    #[error("failed to pin thread to core {core}")]
    Rejected { core: usize },
}

/// Binds the calling thread to a CPU core
pub trait CoreBinder: Send + Sync + 'static {
    /// Pin the current thread for worker `slot`.
    ///
    /// Returns the core id pinned to, or `None` when binding is a no-op.
    fn bind(&self, slot: usize) -> Result<Option<usize>, AffinityError>;
}

/// Binder backed by `core_affinity`
///
/// Slots map onto detected cores round-robin.
#[derive(Debug, Clone)]
pub struct CoreAffinityBinder {
    cores: Vec<CoreId>,
}

impl CoreAffinityBinder {
    /// Detect the cores available to this process
    pub fn detect() -> Self {
        Self {
            cores: core_affinity::get_core_ids().unwrap_or_default(),
        }
    }

    pub fn available_cores(&self) -> usize {
        self.cores.len()
    }
}

impl CoreBinder for CoreAffinityBinder {
    fn bind(&self, slot: usize) -> Result<Option<usize>, AffinityError> {
        if self.cores.is_empty() {
            return Err(AffinityError::Unsupported);
        }
        let core = self.cores[slot % self.cores.len()];
        if core_affinity::set_for_current(core) {
            Ok(Some(core.id))
        } else {
            Err(AffinityError::Rejected { core: core.id })
        }
    }
}

/// Binder that never pins
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBinder;

impl CoreBinder for NoopBinder {
    fn bind(&self, _slot: usize) -> Result<Option<usize>, AffinityError> {
        Ok(None)
    }
}
