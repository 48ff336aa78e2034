//! Backpressure for the worker pool's overflow queue
//!
//! Admission is an atomic reservation against `slots + overflow capacity`, so
//! the overflow queue can never grow past its cap. Watermark hysteresis on the
//! queued depth drives the upward "stop sending me work" signal.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Overflow queue configuration
///
/// # Example
///
/// ```
/// use genrelay_worker::OverflowConfig;
///
/// let config = OverflowConfig::default()
///     .with_capacity(256)
///     .with_high_watermark(0.8);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverflowConfig {
    /// Maximum number of tasks waiting for a free slot
    pub capacity: usize,

    /// Stop accepting when queued/capacity reaches this ratio
    pub high_watermark: f64,

    /// Resume accepting when queued/capacity drops to this ratio
    pub low_watermark: f64,
}

impl Default for OverflowConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            high_watermark: 0.9,
            low_watermark: 0.7,
        }
    }
}

impl OverflowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the overflow queue cap
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the high watermark (when to stop accepting tasks)
    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Set the low watermark (when to resume accepting tasks)
    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.low_watermark >= self.high_watermark {
            return Err(BackpressureError::InvalidConfig(
                "low_watermark must be less than high_watermark".into(),
            ));
        }
        Ok(())
    }
}

/// Backpressure-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    /// Invalid configuration
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// Shared admission state for one pool
///
/// `outstanding` counts tasks admitted and not yet completed (running plus
/// queued). `queued` mirrors the overflow queue length, written only by the
/// scheduler.
pub struct BackpressureState {
    config: OverflowConfig,
    slots: usize,
    outstanding: AtomicUsize,
    queued: AtomicUsize,
    accepting: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl BackpressureState {
    pub fn new(config: OverflowConfig, slots: usize) -> Self {
        Self {
            config,
            slots: slots.max(1),
            outstanding: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            reason: RwLock::new(None),
        }
    }

    /// Hard limit on admitted, not yet completed tasks
    pub fn limit(&self) -> usize {
        self.slots + self.config.capacity
    }

    /// Reserve room for one task
    ///
    /// Fails when the pool is paused or every slot and queue position is taken.
    pub fn try_admit(&self) -> bool {
        if !self.should_accept() {
            return false;
        }
        let limit = self.limit();
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    /// Release a reservation once its task finished
    pub fn task_completed(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Publish the overflow queue length
    pub fn set_queue_depth(&self, depth: usize) {
        self.queued.store(depth, Ordering::Relaxed);
    }

    /// Check if the pool should take more work
    ///
    /// Implements hysteresis using high/low watermarks to prevent oscillation.
    pub fn should_accept(&self) -> bool {
        let ratio = self.queue_ratio();
        if self.accepting.load(Ordering::Relaxed) {
            if self.config.capacity > 0 && ratio >= self.config.high_watermark {
                self.accepting.store(false, Ordering::Relaxed);
                *self.reason.write() = Some(format!(
                    "overflow queue at {:.1}% of capacity",
                    ratio * 100.0
                ));
                return false;
            }
            true
        } else {
            if ratio <= self.config.low_watermark {
                self.accepting.store(true, Ordering::Relaxed);
                *self.reason.write() = None;
                return true;
            }
            false
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub fn queue_ratio(&self) -> f64 {
        self.queue_depth() as f64 / self.config.capacity.max(1) as f64
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    /// Get the backpressure reason (if any)
    pub fn backpressure_reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Force the pool to stop accepting tasks
    pub fn pause(&self, reason: &str) {
        self.accepting.store(false, Ordering::Relaxed);
        *self.reason.write() = Some(reason.to_string());
    }

    /// Resume accepting tasks (if below low watermark)
    pub fn resume(&self) {
        if self.queue_ratio() <= self.config.low_watermark {
            self.accepting.store(true, Ordering::Relaxed);
            *self.reason.write() = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(capacity: usize, slots: usize) -> BackpressureState {
        let config = OverflowConfig::new()
            .with_capacity(capacity)
            .with_high_watermark(0.8)
            .with_low_watermark(0.5);
        BackpressureState::new(config, slots)
    }

    #[test]
    fn test_default_config() {
        let config = OverflowConfig::default();
        assert_eq!(config.capacity, 1024);
        assert_eq!(config.high_watermark, 0.9);
        assert_eq!(config.low_watermark, 0.7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let invalid = OverflowConfig::new()
            .with_high_watermark(0.5)
            .with_low_watermark(0.8);
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_admission_is_capped_at_slots_plus_capacity() {
        let state = state(3, 2);
        let admitted = (0..10).filter(|_| state.try_admit()).count();
        assert_eq!(admitted, 5);
        assert_eq!(state.outstanding(), 5);

        state.task_completed();
        assert!(state.try_admit());
    }

    #[test]
    fn test_stops_at_high_watermark() {
        let state = state(10, 2);
        state.set_queue_depth(8);

        assert!(!state.should_accept());
        assert!(!state.is_accepting());
        assert!(state.backpressure_reason().is_some());
        assert!(!state.try_admit());
    }

    #[test]
    fn test_hysteresis_prevents_oscillation() {
        let state = state(10, 2);
        state.set_queue_depth(8);
        assert!(!state.should_accept());

        // Between watermarks: still paused
        state.set_queue_depth(7);
        assert!(!state.should_accept());

        state.set_queue_depth(5);
        assert!(state.should_accept());
        assert!(state.backpressure_reason().is_none());
    }

    #[test]
    fn test_zero_capacity_never_trips_watermark() {
        let state = state(0, 2);
        assert!(state.try_admit());
        assert!(state.try_admit());
        assert!(!state.try_admit());
        assert!(state.is_accepting());
    }

    #[test]
    fn test_pause_and_resume() {
        let state = state(10, 1);
        state.pause("draining");
        assert!(!state.is_accepting());
        assert_eq!(state.backpressure_reason(), Some("draining".to_string()));

        state.resume();
        assert!(state.is_accepting());
    }

    #[test]
    fn test_completion_never_underflows() {
        let state = state(1, 1);
        state.task_completed();
        assert_eq!(state.outstanding(), 0);
    }
}
