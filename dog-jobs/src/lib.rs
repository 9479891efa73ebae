//! # dog-jobs: Durable Background Jobs
//!
//! Typed-or-closure job handlers, a store-backed queue that survives
//! restarts, exponential backoff retries, a recurring scheduler and a
//! token-bucket limiter for rate-sensitive upstreams.
//!
//! ## Features
//!
//! - **Durable**: every job is a store row (`MemoryStore`, or `SqliteStore` behind the `sqlite` feature)
//! - **Crash recovery**: `pending` and interrupted `running` rows are picked up by the next instance
//! - **Bounded concurrency**: one supervisor task owns the ready list and the in-flight set
//! - **Backoff**: `retry_delay_ms * backoff_factor^(attempt - 1)`, per job
//! - **At-least-once**: handlers should be idempotent
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_jobs::prelude::*;
//!
//! # async fn run() -> QueueResult<()> {
//! let queue = PersistentQueue::new(MemoryStore::new(), QueueConfig::default())?;
//!
//! queue.register_fn("send_digest", |payload: Payload, meta: JobMeta| async move {
//!     println!("attempt {} for {:?}", meta.attempt, payload.get("user"));
//!     Ok::<(), JobError>(())
//! });
//! queue.start().await?;
//!
//! let mut payload = Payload::new();
//! payload.insert("user".to_string(), "ada".into());
//! queue.enqueue("send_digest", payload, EnqueueOptions::default()).await?;
//!
//! queue.wait_for_idle().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ephemeral;
pub mod job;
pub mod limiter;
pub mod observability;
pub mod persistent;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod types;

mod execution;

pub use config::{QueueConfig, RateLimiterConfig, SchedulerConfig};
pub use error::{JobError, QueueError, QueueResult};
pub use ephemeral::{EphemeralJob, EphemeralQueue};
pub use job::{encode_payload, HandlerRegistry, Job, JobHandler, JobMeta};
pub use limiter::{RateLimiter, RateLimiterStats};
pub use observability::{LastFailure, LiveMetrics, ObservabilityLayer, QueueMetrics};
pub use persistent::{PersistentQueue, WeakPersistentQueue};
pub use queue::JobQueue;
pub use scheduler::JobScheduler;
pub use store::{JobStore, MemoryStore, StatusCounts};
pub use types::{EnqueueOptions, FailureOutcome, JobEvent, JobId, JobRecord, JobStatus, Payload, RetryPolicy};

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

/// Everything needed to define handlers and run a queue
pub mod prelude {
    pub use crate::{
        EphemeralQueue, JobQueue, JobScheduler, PersistentQueue, RateLimiter, WeakPersistentQueue,
    };

    pub use crate::{
        QueueConfig, RateLimiterConfig, SchedulerConfig,
    };

    pub use crate::{
        EnqueueOptions, Job, JobError, JobHandler, JobId, JobMeta, JobStatus, Payload, QueueError, QueueResult,
        RetryPolicy,
    };

    pub use crate::{JobStore, MemoryStore};

    #[cfg(feature = "sqlite")]
    pub use crate::SqliteStore;

    pub use async_trait::async_trait;
}
