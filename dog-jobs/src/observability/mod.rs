//! Job lifecycle events and live counters shared by both queue variants.

pub mod metrics;

pub use metrics::{JobTypeMetrics, LastFailure, LiveMetrics, QueueMetrics};

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_core::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::store::StatusCounts;
use crate::types::record::now;
use crate::{JobEvent, JobRecord};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

const EVENT_CAPACITY: usize = 1024;

/// Fan-out of job events plus the counters behind `metrics()`
#[derive(Clone)]
pub struct ObservabilityLayer {
    events: broadcast::Sender<JobEvent>,
    metrics: Arc<LiveMetrics>,
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            metrics: Arc::new(LiveMetrics::new()),
        }
    }

    pub fn live_metrics(&self) -> &Arc<LiveMetrics> {
        &self.metrics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Events emitted from now on; lagged events are skipped
    pub fn event_stream(&self) -> BoxStream<JobEvent> {
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok());
        Box::pin(stream)
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn record_enqueued(&self, record: &JobRecord) {
        self.metrics.increment_jobs_enqueued(&record.job_type);
        self.emit(JobEvent::Enqueued {
            job_id: record.id.clone(),
            job_type: record.job_type.clone(),
            at: now(),
        });
    }

    pub(crate) fn record_started(&self, record: &JobRecord) {
        self.emit(JobEvent::Started {
            job_id: record.id.clone(),
            attempt: record.attempts.saturating_add(1),
            at: now(),
        });
    }

    pub(crate) fn record_completed(&self, record: &JobRecord, elapsed: Duration) {
        self.metrics.record_execution_time(&record.job_type, elapsed);
        self.metrics.increment_jobs_completed(&record.job_type);
        self.emit(JobEvent::Completed {
            job_id: record.id.clone(),
            at: now(),
        });
    }

    pub(crate) fn record_retry(&self, record: &JobRecord, delay: Duration, retry_at: DateTime<Utc>, elapsed: Duration) {
        self.metrics.record_execution_time(&record.job_type, elapsed);
        self.metrics.increment_jobs_retried(&record.job_type);
        self.emit(JobEvent::Retrying {
            job_id: record.id.clone(),
            attempt: record.attempts,
            delay_ms: delay.as_millis() as u64,
            retry_at,
            error: record.last_error.clone().unwrap_or_default(),
            at: now(),
        });
    }

    pub(crate) fn record_failed(&self, record: &JobRecord, elapsed: Option<Duration>) {
        if let Some(elapsed) = elapsed {
            self.metrics.record_execution_time(&record.job_type, elapsed);
        }

        let error = record.last_error.clone().unwrap_or_default();
        let at = now();
        self.metrics.increment_jobs_failed(LastFailure {
            job_id: record.id.clone(),
            job_type: record.job_type.clone(),
            error: error.clone(),
            at,
        });
        self.emit(JobEvent::Failed {
            job_id: record.id.clone(),
            error,
            at,
        });
    }

    pub(crate) fn snapshot(&self, backend: &str, counts: StatusCounts) -> QueueMetrics {
        QueueMetrics::collect(backend, &self.metrics, counts)
    }
}
