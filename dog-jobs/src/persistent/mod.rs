//! Durable queue: every job lives in a [`JobStore`] row, the supervisor
//! task executes due rows, and a fresh instance over the same store picks
//! up whatever a previous process left pending or running.

mod supervisor;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, instrument};

use crate::config::QueueConfig;
use crate::execution::Executor;
use crate::job::{encode_payload, handler_fn, HandlerRegistry, Job, JobHandler, JobMeta, TypedHandler};
use crate::observability::{BoxStream, ObservabilityLayer, QueueMetrics};
use crate::queue::JobQueue;
use crate::store::JobStore;
use crate::{EnqueueOptions, JobError, JobEvent, JobId, JobRecord, Payload, QueueError, QueueResult};

use supervisor::{Command, Supervisor};

/// Store-backed job queue.
///
/// Construction is synchronous so handlers can be registered before
/// [`start`](Self::start) recovers leftover rows and begins dispatching.
/// Clones share the same queue.
#[derive(Clone)]
pub struct PersistentQueue {
    inner: Arc<Inner>,
}

/// Non-owning handle for handler contexts that enqueue into their own queue.
///
/// A handler registered on a queue that held a strong clone of that queue
/// would keep it alive forever.
#[derive(Clone)]
pub struct WeakPersistentQueue {
    inner: Weak<Inner>,
}

impl WeakPersistentQueue {
    /// `None` once every strong handle has been dropped
    pub fn upgrade(&self) -> Option<PersistentQueue> {
        self.inner.upgrade().map(|inner| PersistentQueue { inner })
    }
}

struct Inner {
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    observability: ObservabilityLayer,
    commands: mpsc::UnboundedSender<Command>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    started: AtomicBool,
    stopped: AtomicBool,

    /// Jobs enqueued before `start`, still waiting on the channel
    buffered: AtomicUsize,
}

impl PersistentQueue {
    /// Create a queue over `store`. Fails with `InvalidConfig` on a zero
    /// concurrency, poll interval or batch size.
    pub fn new(store: impl JobStore, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;

        let (commands, receiver) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store: Arc::new(store),
                registry: HandlerRegistry::new(),
                observability: ObservabilityLayer::new(),
                commands,
                receiver: Mutex::new(Some(receiver)),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                buffered: AtomicUsize::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn downgrade(&self) -> WeakPersistentQueue {
        WeakPersistentQueue {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Register a handler, replacing any previous one for `job_type`
    pub fn register_handler(&self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        self.inner.registry.register(job_type, Arc::new(handler));
    }

    /// Register an async closure `(payload, meta) -> Result<R, JobError>`
    pub fn register_fn<F, Fut, R>(&self, job_type: impl Into<String>, f: F)
    where
        F: Fn(Payload, JobMeta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, JobError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.register_handler(job_type, handler_fn(f));
    }

    /// Register a typed job under `J::JOB_TYPE`
    pub fn register_job<J: Job>(&self, context: J::Context) {
        self.register_handler(J::JOB_TYPE, TypedHandler::<J>::new(context));
    }

    pub fn unregister_handler(&self, job_type: &str) -> bool {
        self.inner.registry.unregister(job_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.inner.registry.registered_types()
    }

    /// Recover leftover rows and start the supervisor.
    ///
    /// Returns how many `pending`/`running` rows were recovered. Calling it
    /// again is a no-op returning `0`.
    #[instrument(skip(self), fields(queue = %self.inner.config.name))]
    pub async fn start(&self) -> QueueResult<usize> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }

        let rows = match self.inner.store.recoverable().await {
            Ok(rows) => rows,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let Some(receiver) = self.inner.receiver.lock().take() else {
            return Err(QueueError::Internal("queue supervisor already taken".to_string()));
        };

        let config = &self.inner.config;
        let executor = Executor::new(
            &config.name,
            self.inner.registry.clone(),
            self.inner.observability.clone(),
            config.max_retry_delay,
        );
        let mut supervisor = Supervisor::new(
            config.name.clone(),
            self.inner.store.clone(),
            executor,
            config.concurrency,
            config.poll_interval,
            config.poll_batch_size,
        );

        let recovered = supervisor.recover(rows).await;
        tokio::spawn(supervisor.run(receiver));

        info!(
            backend = self.inner.store.backend(),
            concurrency = config.concurrency,
            recovered,
            "Queue started"
        );
        Ok(recovered)
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Persist a new job and hand it to the supervisor.
    ///
    /// Returns as soon as the row is written; the handler runs later.
    #[instrument(skip(self, payload, options), fields(queue = %self.inner.config.name))]
    pub async fn enqueue(&self, job_type: &str, payload: Payload, options: EnqueueOptions) -> QueueResult<JobId> {
        self.inner.registry.ensure_registered(job_type)?;
        if !self.inner.store.is_open() {
            return Err(QueueError::StoreClosed);
        }

        let policy = options.resolve(&self.inner.config.retry)?;
        let record = JobRecord::new(job_type, payload, policy);
        self.inner.store.insert(&record).await?;

        let job_id = record.id.clone();
        self.inner.observability.record_enqueued(&record);
        if !self.is_started() {
            self.inner.buffered.fetch_add(1, Ordering::SeqCst);
        }
        debug!(job_id = %job_id, job_type = %job_type, "Job enqueued");

        // A closed channel means the supervisor is gone; the row stays
        // pending for the next instance.
        let _ = self.inner.commands.send(Command::Enqueued(record));

        Ok(job_id)
    }

    /// Enqueue a typed job with its own options
    pub async fn enqueue_job<J: Job>(&self, job: &J) -> QueueResult<JobId> {
        let payload = encode_payload(job)?;
        self.enqueue(J::JOB_TYPE, payload, job.options()).await
    }

    /// Resolve once the ready list is empty and no handler is running.
    ///
    /// Retries scheduled for later are not waited for. Before `start` this
    /// resolves at once unless jobs were enqueued, in which case it waits
    /// until the queue has been started and drained them.
    pub async fn wait_for_idle(&self) {
        if !self.is_started() && (self.is_stopped() || self.inner.buffered.load(Ordering::SeqCst) == 0) {
            return;
        }

        let (tx, rx) = oneshot::channel();
        if self.inner.commands.send(Command::WaitIdle(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Stop polling and dispatching. Running handlers finish and persist
    /// their outcome; jobs still queued stay `pending` in the store.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.commands.send(Command::Stop);
    }

    /// Live counters plus status counts read from the store
    pub async fn metrics(&self) -> QueueResult<QueueMetrics> {
        let counts = self.inner.store.status_counts().await?;
        Ok(self.inner.observability.snapshot(self.inner.store.backend(), counts))
    }

    /// Current stored state of a job
    pub async fn job(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        self.inner.store.get(id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.observability.subscribe()
    }

    pub fn event_stream(&self) -> BoxStream<JobEvent> {
        self.inner.observability.event_stream()
    }

    pub fn observability(&self) -> &ObservabilityLayer {
        &self.inner.observability
    }
}

#[async_trait]
impl JobQueue for PersistentQueue {
    fn name(&self) -> &str {
        PersistentQueue::name(self)
    }

    async fn enqueue(&self, job_type: &str, payload: Payload, options: EnqueueOptions) -> QueueResult<JobId> {
        PersistentQueue::enqueue(self, job_type, payload, options).await
    }

    async fn wait_for_idle(&self) {
        PersistentQueue::wait_for_idle(self).await
    }

    fn stop(&self) {
        PersistentQueue::stop(self)
    }

    async fn metrics(&self) -> QueueResult<QueueMetrics> {
        PersistentQueue::metrics(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::{JobStatus, RetryPolicy};
    use std::time::Duration;

    #[test]
    fn test_zero_concurrency_is_invalid() {
        let result = PersistentQueue::new(MemoryStore::new(), QueueConfig::new().with_concurrency(0));
        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let queue = PersistentQueue::new(MemoryStore::new(), QueueConfig::default()).unwrap();

        assert_eq!(queue.start().await.unwrap(), 0);
        assert_eq!(queue.start().await.unwrap(), 0);
        assert!(queue.is_started());
    }

    #[tokio::test]
    async fn test_jobs_enqueued_before_start_run_after_start() {
        let store = MemoryStore::new();
        let queue = PersistentQueue::new(store.clone(), QueueConfig::default()).unwrap();
        queue.register_fn("noop", |_payload, _meta| async { Ok::<(), JobError>(()) });

        let id = queue.enqueue("noop", Payload::new(), EnqueueOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.job(&id).await.unwrap().unwrap().status, JobStatus::Pending);

        queue.start().await.unwrap();
        queue.wait_for_idle().await;

        assert_eq!(queue.job(&id).await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_wait_for_idle_before_start_resolves_when_nothing_enqueued() {
        let queue = PersistentQueue::new(MemoryStore::new(), QueueConfig::default()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), queue.wait_for_idle())
            .await
            .expect("an unstarted, empty queue is idle");
        assert!(!queue.is_started());
    }

    #[tokio::test]
    async fn test_stop_before_start_does_not_dispatch_recovered_jobs() {
        let store = MemoryStore::new();
        let leftover = JobRecord::new("count", Payload::new(), RetryPolicy::default());
        store.insert(&leftover).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let queue = PersistentQueue::new(store.clone(), QueueConfig::default()).unwrap();
        let counter = calls.clone();
        queue.register_fn("count", move |_payload, _meta| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), JobError>(())
            }
        });

        queue.stop();
        assert_eq!(queue.start().await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.job(&leftover.id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_weak_handle_does_not_keep_queue_alive() {
        let queue = PersistentQueue::new(MemoryStore::new(), QueueConfig::default()).unwrap();
        let weak = queue.downgrade();

        // A handler context holding the weak handle must not form a cycle
        let context = weak.clone();
        queue.register_fn("fan_out", move |_payload, _meta| {
            let context = context.clone();
            async move {
                let alive = context.upgrade().is_some();
                Ok::<bool, JobError>(alive)
            }
        });

        assert_eq!(weak.upgrade().map(|q| q.name().to_string()), Some("jobs".to_string()));
        drop(queue);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_stop_leaves_queued_jobs_pending() {
        let store = MemoryStore::new();
        let queue = PersistentQueue::new(store.clone(), QueueConfig::default()).unwrap();
        queue.register_fn("noop", |_payload, _meta| async { Ok::<(), JobError>(()) });
        queue.start().await.unwrap();

        queue.stop();
        let id = queue.enqueue("noop", Payload::new(), EnqueueOptions::default()).await.unwrap();
        queue.wait_for_idle().await;

        assert!(queue.is_stopped());
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(queue.job(&id).await.unwrap().unwrap().status, JobStatus::Pending);
    }
}
