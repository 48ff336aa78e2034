// Outcome store
//
// Side-channel memory for settled job outcomes. Inline dispatch records every
// outcome here best-effort; detached (async HTTP) waiters are resolved into it.
// Readiness pings it as the "persistent store" dependency.

use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::job::JobId;
use crate::result::OutcomeRecord;

/// Store errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Store cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Storage for settled job outcomes
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Record an outcome, replacing any earlier record for the same job
    async fn record(&self, record: OutcomeRecord) -> Result<(), StoreError>;

    /// Look up the outcome of a job
    async fn get(&self, job_id: JobId) -> Result<Option<OutcomeRecord>, StoreError>;

    /// Trivial round-trip used by readiness checks
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Bounded in-memory outcome store
///
/// Evicts the oldest record once `capacity` is reached. Reads use `peek`,
/// so eviction order is by first insertion.
#[derive(Debug, Clone)]
pub struct InMemoryOutcomeStore {
    records: Arc<RwLock<LruCache<JobId, OutcomeRecord>>>,
    reachable: Arc<AtomicBool>,
}

impl Default for InMemoryOutcomeStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl InMemoryOutcomeStore {
    /// Create a new in-memory store holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: Arc::new(RwLock::new(LruCache::new(capacity))),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage (useful for testing)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.reachable.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store marked unreachable".into()))
        }
    }
}

#[async_trait]
impl OutcomeStore for InMemoryOutcomeStore {
    async fn record(&self, record: OutcomeRecord) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut records = self.records.write().await;
        // Replace in place so a rewrite does not count as a fresh insert
        if let Some(existing) = records.peek_mut(&record.job_id) {
            *existing = record;
        } else {
            records.put(record.job_id, record);
        }
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<OutcomeRecord>, StoreError> {
        self.check_reachable()?;
        Ok(self.records.read().await.peek(&job_id).cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_reachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::JobOutcome;
    use serde_json::json;

    fn record(job_id: JobId) -> OutcomeRecord {
        OutcomeRecord::new(
            job_id,
            JobOutcome::Succeeded {
                payload: json!({"ok": true}),
                quality_score: None,
            },
        )
    }

    #[tokio::test]
    async fn test_record_and_get() {
        let store = InMemoryOutcomeStore::new(10);
        let job_id = JobId::new();

        store.record(record(job_id)).await.unwrap();

        let found = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(found.job_id, job_id);
        assert!(store.get(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evicts_oldest_when_full() {
        let store = InMemoryOutcomeStore::new(2);
        let first = JobId::new();
        let second = JobId::new();
        let third = JobId::new();

        store.record(record(first)).await.unwrap();
        store.record(record(second)).await.unwrap();
        store.record(record(third)).await.unwrap();

        assert_eq!(store.len().await, 2);
        assert!(store.get(first).await.unwrap().is_none());
        assert!(store.get(third).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reads_and_rewrites_keep_insertion_order() {
        let store = InMemoryOutcomeStore::new(2);
        let first = JobId::new();
        let second = JobId::new();

        store.record(record(first)).await.unwrap();
        store.record(record(second)).await.unwrap();
        assert!(store.get(first).await.unwrap().is_some());
        store.record(record(first)).await.unwrap();
        store.record(record(JobId::new())).await.unwrap();

        assert!(store.get(first).await.unwrap().is_none());
        assert!(store.get(second).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_ping() {
        let store = InMemoryOutcomeStore::default();
        assert!(store.ping().await.is_ok());

        store.set_reachable(false);
        assert!(store.ping().await.is_err());
        assert!(store.record(record(JobId::new())).await.is_err());

        store.set_reachable(true);
        assert!(store.ping().await.is_ok());
    }
}
