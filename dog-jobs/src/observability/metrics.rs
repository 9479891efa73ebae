use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::store::StatusCounts;
use crate::JobId;

/// Most recent permanent failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastFailure {
    pub job_id: JobId,
    pub job_type: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Live metrics collector for queue operations
#[derive(Default)]
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,

    job_type_metrics: RwLock<HashMap<String, JobTypeMetrics>>,
    last_failure: RwLock<Option<LastFailure>>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_type(&self, job_type: &str, update: impl FnOnce(&mut JobTypeMetrics)) {
        let mut metrics = self.job_type_metrics.write();
        match metrics.get_mut(job_type) {
            Some(entry) => update(entry),
            None => {
                let mut entry = JobTypeMetrics::default();
                update(&mut entry);
                metrics.insert(job_type.to_string(), entry);
            }
        }
    }

    pub fn increment_jobs_enqueued(&self, job_type: &str) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        self.with_type(job_type, |m| m.enqueued += 1);
    }

    pub fn increment_jobs_completed(&self, job_type: &str) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.with_type(job_type, |m| m.completed += 1);
    }

    pub fn increment_jobs_retried(&self, job_type: &str) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
        self.with_type(job_type, |m| m.retried += 1);
    }

    /// Count a permanent failure and remember it as the last one
    pub fn increment_jobs_failed(&self, failure: LastFailure) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.with_type(&failure.job_type, |m| m.failed += 1);
        *self.last_failure.write() = Some(failure);
    }

    /// Record how long one handler invocation took
    pub fn record_execution_time(&self, job_type: &str, elapsed: Duration) {
        let millis = elapsed.as_millis().min(u64::MAX as u128) as u64;
        self.with_type(job_type, |m| {
            m.executions += 1;
            m.total_execution_ms = m.total_execution_ms.saturating_add(millis);
        });
    }

    pub fn jobs_enqueued(&self) -> u64 {
        self.jobs_enqueued.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn jobs_retried(&self) -> u64 {
        self.jobs_retried.load(Ordering::Relaxed)
    }

    pub fn last_failure(&self) -> Option<LastFailure> {
        self.last_failure.read().clone()
    }

    /// Get metrics for a specific job type
    pub fn job_type_metrics(&self, job_type: &str) -> Option<JobTypeMetrics> {
        self.job_type_metrics.read().get(job_type).cloned()
    }

    /// Get all job type metrics
    pub fn all_job_type_metrics(&self) -> HashMap<String, JobTypeMetrics> {
        self.job_type_metrics.read().clone()
    }
}

/// Metrics for a specific job type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTypeMetrics {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub executions: u64,
    pub total_execution_ms: u64,
}

impl JobTypeMetrics {
    /// Calculate success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let total_processed = self.completed + self.failed;
        if total_processed == 0 {
            100.0
        } else {
            (self.completed as f64 / total_processed as f64) * 100.0
        }
    }

    /// Calculate retry rate as percentage
    pub fn retry_rate(&self) -> f64 {
        if self.enqueued == 0 {
            0.0
        } else {
            (self.retried as f64 / self.enqueued as f64) * 100.0
        }
    }

    /// Mean handler run time across all attempts
    pub fn average_execution_time(&self) -> Option<Duration> {
        if self.executions == 0 {
            None
        } else {
            Some(Duration::from_millis(self.total_execution_ms / self.executions))
        }
    }
}

/// Point-in-time view returned by `metrics()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Storage backend identifier (`memory`, `sqlite`)
    pub backend: String,

    pub enqueued: u64,
    pub completed: u64,
    pub retried: u64,

    /// Permanent failures seen by this instance
    pub failed: u64,

    /// Failed rows in the store, including earlier runs
    pub failed_in_store: u64,

    pub pending: u64,
    pub running: u64,
    pub last_failure: Option<LastFailure>,
    pub job_types: HashMap<String, JobTypeMetrics>,
}

impl QueueMetrics {
    pub(crate) fn collect(backend: &str, live: &LiveMetrics, counts: StatusCounts) -> Self {
        Self {
            backend: backend.to_string(),
            enqueued: live.jobs_enqueued(),
            completed: live.jobs_completed(),
            retried: live.jobs_retried(),
            failed: live.jobs_failed(),
            failed_in_store: counts.failed,
            pending: counts.pending,
            running: counts.running,
            last_failure: live.last_failure(),
            job_types: live.all_job_type_metrics(),
        }
    }
}
