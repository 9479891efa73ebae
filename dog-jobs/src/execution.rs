//! One attempt of one job: handler lookup, invocation, and the resulting
//! state transition. Both queue variants run jobs through [`Executor`] and
//! only differ in where they keep the record afterwards.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::job::{HandlerRegistry, JobHandler, JobMeta};
use crate::observability::ObservabilityLayer;
use crate::{FailureOutcome, JobError, JobRecord, QueueError};

/// Where an attempt left the job
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Settled {
    Completed(Option<Value>),
    Retry,
    Failed,
}

#[derive(Clone)]
pub(crate) struct Executor {
    queue: Arc<str>,
    registry: HandlerRegistry,
    observability: ObservabilityLayer,
    max_retry_delay: Option<Duration>,
}

impl Executor {
    pub(crate) fn new(
        queue: &str,
        registry: HandlerRegistry,
        observability: ObservabilityLayer,
        max_retry_delay: Option<Duration>,
    ) -> Self {
        Self {
            queue: Arc::from(queue),
            registry,
            observability,
            max_retry_delay,
        }
    }

    /// Run one attempt of a job the caller has already marked `running`
    pub(crate) async fn run(&self, record: &mut JobRecord) -> Settled {
        self.observability.record_started(record);

        let Some(handler) = self.registry.get(&record.job_type) else {
            let reason = QueueError::HandlerNotRegistered(record.job_type.clone()).to_string();
            error!(
                queue = %self.queue,
                job_id = %record.id,
                job_type = %record.job_type,
                "{}", reason
            );
            record.fail(reason);
            self.observability.record_failed(record, None);
            return Settled::Failed;
        };

        let (result, elapsed) = invoke(handler, record).await;
        self.settle(record, result, elapsed)
    }

    fn settle(
        &self,
        record: &mut JobRecord,
        result: Result<Option<Value>, JobError>,
        elapsed: Duration,
    ) -> Settled {
        let elapsed_ms = elapsed.as_millis() as u64;

        let error = match result {
            Ok(value) => {
                record.complete();
                info!(
                    queue = %self.queue,
                    job_id = %record.id,
                    job_type = %record.job_type,
                    attempt = record.attempts + 1,
                    elapsed_ms,
                    "Job completed"
                );
                self.observability.record_completed(record, elapsed);
                return Settled::Completed(value);
            }
            Err(error) => error,
        };

        match record.record_failure(&error, self.max_retry_delay) {
            FailureOutcome::Retry { attempt, delay, retry_at } => {
                warn!(
                    queue = %self.queue,
                    job_id = %record.id,
                    job_type = %record.job_type,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job failed, retry scheduled"
                );
                self.observability.record_retry(record, delay, retry_at, elapsed);
                Settled::Retry
            }
            FailureOutcome::Exhausted { attempts } => {
                error!(
                    queue = %self.queue,
                    job_id = %record.id,
                    job_type = %record.job_type,
                    attempts,
                    error = %error,
                    "Job failed permanently, retries exhausted"
                );
                self.observability.record_failed(record, Some(elapsed));
                Settled::Failed
            }
            FailureOutcome::Rejected { attempts } => {
                error!(
                    queue = %self.queue,
                    job_id = %record.id,
                    job_type = %record.job_type,
                    attempts,
                    error = %error,
                    "Job failed permanently"
                );
                self.observability.record_failed(record, Some(elapsed));
                Settled::Failed
            }
        }
    }
}

/// Invoke the handler, turning a panic into a retryable failure
async fn invoke(handler: Arc<dyn JobHandler>, record: &JobRecord) -> (Result<Option<Value>, JobError>, Duration) {
    let meta = JobMeta::from_record(record);
    let started = Instant::now();

    let result = AssertUnwindSafe(handler.handle(record.payload.clone(), meta))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(JobError::retryable(format!("handler panicked: {}", panic_message(&*panic)))));

    (result, started.elapsed())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::handler_fn;
    use crate::{JobStatus, Payload, RetryPolicy};
    use tracing_test::traced_test;

    fn executor(registry: HandlerRegistry) -> Executor {
        Executor::new("test", registry, ObservabilityLayer::new(), None)
    }

    fn running(job_type: &str) -> JobRecord {
        let mut record = JobRecord::new(job_type, Payload::new(), RetryPolicy::default());
        record.mark_running();
        record
    }

    #[tokio::test]
    #[traced_test]
    async fn test_retry_is_logged_with_delay() {
        let registry = HandlerRegistry::new();
        registry.register(
            "flaky",
            Arc::new(handler_fn(|_p, _m| async { Err::<(), _>(JobError::retryable("portal timeout")) })),
        );

        let mut record = running("flaky");
        let settled = executor(registry).run(&mut record).await;

        assert!(matches!(settled, Settled::Retry));
        assert_eq!(record.status, JobStatus::Pending);
        assert!(logs_contain("Job failed, retry scheduled"));
        assert!(logs_contain("delay_ms=1000"));
    }

    #[tokio::test]
    async fn test_missing_handler_fails_permanently() {
        let mut record = running("ghost");
        let settled = executor(HandlerRegistry::new()).run(&mut record).await;

        assert_eq!(settled, Settled::Failed);
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let registry = HandlerRegistry::new();
        registry.register(
            "boom",
            Arc::new(handler_fn(|_p, _m| async {
                if true {
                    panic!("kaboom");
                }
                Ok::<(), JobError>(())
            })),
        );

        let mut record = running("boom");
        let settled = executor(registry).run(&mut record).await;

        assert!(matches!(settled, Settled::Retry));
        assert_eq!(record.last_error.as_deref(), Some("handler panicked: kaboom"));
    }

    #[tokio::test]
    async fn test_success_carries_result() {
        let registry = HandlerRegistry::new();
        registry.register("count", Arc::new(handler_fn(|_p, _m| async { Ok::<_, JobError>(7) })));

        let mut record = running("count");
        let settled = executor(registry).run(&mut record).await;

        assert_eq!(settled, Settled::Completed(Some(Value::from(7))));
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.attempts, 0);
    }
}
