use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{JobStore, StatusCounts};
use crate::{JobId, JobRecord, JobStatus, QueueError, QueueResult};

/// In-process job table for tests and development.
///
/// Clones share the same table, so a second queue built on a clone sees
/// whatever the first one left behind (the way a restarted process sees
/// its database file).
#[derive(Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<RwLock<HashMap<JobId, JobRecord>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored record, oldest first
    pub fn snapshot(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.jobs.read().values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::StoreClosed)
        } else {
            Ok(())
        }
    }

    fn select(&self, filter: impl Fn(&JobRecord) -> bool) -> Vec<JobRecord> {
        let mut rows: Vec<JobRecord> = self
            .jobs
            .read()
            .values()
            .filter(|r| filter(r))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.availability_key());
        rows
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, record: &JobRecord) -> QueueResult<()> {
        self.ensure_open()?;

        let mut jobs = self.jobs.write();
        if jobs.contains_key(&record.id) {
            return Err(QueueError::Store(format!("duplicate job id: {}", record.id)));
        }
        jobs.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &JobRecord) -> QueueResult<()> {
        self.ensure_open()?;

        match self.jobs.write().get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(QueueError::JobNotFound(record.id.to_string())),
        }
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        self.ensure_open()?;
        Ok(self.jobs.read().get(id).cloned())
    }

    async fn recoverable(&self) -> QueueResult<Vec<JobRecord>> {
        self.ensure_open()?;
        Ok(self.select(|r| matches!(r.status, JobStatus::Pending | JobStatus::Running)))
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<JobRecord>> {
        self.ensure_open()?;

        let mut rows = self.select(|r| r.status == JobStatus::Pending && r.is_due(now));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn status_counts(&self) -> QueueResult<StatusCounts> {
        self.ensure_open()?;

        let mut counts = StatusCounts::default();
        for record in self.jobs.read().values() {
            counts.add(record.status, 1);
        }
        Ok(counts)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Payload, RetryPolicy};

    fn pending(job_type: &str) -> JobRecord {
        JobRecord::new(job_type, Payload::new(), RetryPolicy::default())
    }

    #[tokio::test]
    async fn test_due_orders_by_availability() {
        let store = MemoryStore::new();

        let mut later = pending("later");
        later.available_at = later.available_at - chrono::Duration::milliseconds(10);
        let mut earliest = pending("earliest");
        earliest.available_at = earliest.available_at - chrono::Duration::milliseconds(500);
        let mut future = pending("future");
        future.available_at = future.available_at + chrono::Duration::seconds(60);

        for record in [&later, &earliest, &future] {
            store.insert(record).await.unwrap();
        }

        let due = store.due(Utc::now(), 50).await.unwrap();
        let types: Vec<&str> = due.iter().map(|r| r.job_type.as_str()).collect();
        assert_eq!(types, vec!["earliest", "later"]);

        let limited = store.due(Utc::now(), 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_recoverable_skips_terminal_rows() {
        let store = MemoryStore::new();

        let mut running = pending("running");
        running.mark_running();
        let mut done = pending("done");
        done.complete();

        store.insert(&running).await.unwrap();
        store.insert(&done).await.unwrap();

        let rows = store.recoverable().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, running.id);

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.running, 1);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.total(), 2);
    }

    #[tokio::test]
    async fn test_update_unknown_job() {
        let store = MemoryStore::new();
        let result = store.update(&pending("ghost")).await;
        assert!(matches!(result, Err(QueueError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_writes() {
        let store = MemoryStore::new();
        let shared = store.clone();
        store.close().await;

        assert!(!shared.is_open());
        assert!(matches!(shared.insert(&pending("a")).await, Err(QueueError::StoreClosed)));
    }
}
