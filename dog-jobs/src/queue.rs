use async_trait::async_trait;

use crate::observability::QueueMetrics;
use crate::{EnqueueOptions, JobId, Payload, QueueResult};

/// Operations shared by the persistent and ephemeral queues.
///
/// The scheduler and handlers that fan out follow-up work only need this
/// trait, so they run unchanged against either variant.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue name used in log events
    fn name(&self) -> &str;

    /// Accept a job and return its id without waiting for it to run
    async fn enqueue(&self, job_type: &str, payload: Payload, options: EnqueueOptions) -> QueueResult<JobId>;

    /// Resolve once nothing is queued or executing
    async fn wait_for_idle(&self);

    /// Stop dispatching; in-flight jobs still finish
    fn stop(&self);

    async fn metrics(&self) -> QueueResult<QueueMetrics>;
}
