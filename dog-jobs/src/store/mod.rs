//! Durable job storage.
//!
//! A store only persists records; the queues decide every state transition
//! and hand the store the resulting row.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, JobRecord, JobStatus, QueueResult};

/// Row counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub(crate) fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed
    }
}

/// Storage contract used by the persistent queue
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new record. Fails if the id already exists.
    async fn insert(&self, record: &JobRecord) -> QueueResult<()>;

    /// Overwrite the mutable columns of an existing record
    async fn update(&self, record: &JobRecord) -> QueueResult<()>;

    async fn get(&self, id: &JobId) -> QueueResult<Option<JobRecord>>;

    /// Rows in `pending` or `running`, ordered by `available_at` then `created_at`
    async fn recoverable(&self) -> QueueResult<Vec<JobRecord>>;

    /// Up to `limit` pending rows with `available_at <= now`, in availability order
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<JobRecord>>;

    async fn status_counts(&self) -> QueueResult<StatusCounts>;

    /// Short backend identifier reported in metrics
    fn backend(&self) -> &'static str;

    fn is_open(&self) -> bool;

    /// Close the store; later calls fail with `StoreClosed`
    async fn close(&self);
}
