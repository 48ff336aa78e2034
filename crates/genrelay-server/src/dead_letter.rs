// Dead-letter log
// Decision: The in-memory mirror is bounded (DEAD_LETTER_RETENTION); the broker topic is the durable trail.

use std::collections::VecDeque;
use std::sync::Arc;

use genrelay_broker::topics;
use genrelay_core::{DeadLetterEntry, DeadLetterReason, JobId};
use parking_lot::Mutex;

use crate::metrics::GatewayMetrics;
use crate::outbox::Outbox;

/// Append-only record of undeliverable messages
pub struct DeadLetterLog {
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    retention: usize,
    outbox: Outbox,
    metrics: Arc<GatewayMetrics>,
}

impl DeadLetterLog {
    pub fn new(retention: usize, outbox: Outbox, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            retention: retention.max(1),
            outbox,
            metrics,
        }
    }

    /// Record an entry, mirror it, and forward it to `generation.deadletter`
    pub fn record(&self, entry: DeadLetterEntry) {
        tracing::warn!(
            reason = %entry.reason,
            job_id = ?entry.job_id,
            detail = entry.detail.as_deref().unwrap_or(""),
            "Dead-lettered"
        );
        self.metrics.dead_lettered(entry.reason.as_str());
        self.outbox.publish(topics::DEAD_LETTER, &entry);

        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.retention {
            entries.pop_front();
        }
    }

    /// Most recent entries first
    pub fn recent(&self, limit: usize) -> Vec<DeadLetterEntry> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Retained entries for one job and reason
    pub fn count_for(&self, job_id: JobId, reason: DeadLetterReason) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.job_id == Some(job_id) && e.reason == reason)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(retention: usize) -> DeadLetterLog {
        DeadLetterLog::new(
            retention,
            Outbox::disabled(),
            Arc::new(GatewayMetrics::new().unwrap()),
        )
    }

    #[test]
    fn test_record_and_list_newest_first() {
        let log = log(10);
        let first = JobId::new();
        let second = JobId::new();
        log.record(DeadLetterEntry::timeout(first, 100));
        log.record(DeadLetterEntry::new(DeadLetterReason::OrphanResult).with_job_id(second));

        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].job_id, Some(second));
        assert_eq!(log.count_for(first, DeadLetterReason::Timeout), 1);
        assert_eq!(log.metrics.dead_letter_count("timeout"), 1);
    }

    #[test]
    fn test_retention_is_bounded() {
        let log = log(2);
        for _ in 0..5 {
            log.record(DeadLetterEntry::new(DeadLetterReason::MissingJobId));
        }
        assert_eq!(log.len(), 2);
        assert_eq!(log.metrics.dead_letter_count("missing_job_id"), 5);
    }
}
