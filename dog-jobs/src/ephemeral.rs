//! In-memory queue with the same contract as the persistent one.
//!
//! Nothing survives the process. Jobs that fail permanently are kept on a
//! dead-letter list, and every job keeps the value its handler returned.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument};

use crate::config::QueueConfig;
use crate::execution::{Executor, Settled};
use crate::job::{encode_payload, handler_fn, HandlerRegistry, Job, JobHandler, JobMeta, TypedHandler};
use crate::observability::{BoxStream, ObservabilityLayer, QueueMetrics};
use crate::queue::JobQueue;
use crate::store::StatusCounts;
use crate::types::record::now;
use crate::{EnqueueOptions, JobError, JobEvent, JobId, JobRecord, JobStatus, Payload, QueueResult};

/// A job held by the ephemeral queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemeralJob {
    pub record: JobRecord,

    /// Value returned by the handler on success
    pub result: Option<Value>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, EphemeralJob>,
    dead_letters: Vec<JobId>,
}

type SharedState = Arc<RwLock<State>>;

enum Command {
    Enqueued(JobRecord),
    WaitIdle(oneshot::Sender<()>),
    Stop,
}

/// Non-durable job queue
#[derive(Clone)]
pub struct EphemeralQueue {
    inner: Arc<Inner>,
}

struct Inner {
    config: QueueConfig,
    registry: HandlerRegistry,
    observability: ObservabilityLayer,
    state: SharedState,
    commands: mpsc::UnboundedSender<Command>,
    stopped: AtomicBool,
}

impl EphemeralQueue {
    /// Create the queue and spawn its supervisor on the current Tokio runtime
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let registry = HandlerRegistry::new();
        let observability = ObservabilityLayer::new();
        let state = SharedState::default();

        let supervisor = Supervisor {
            name: config.name.clone(),
            executor: Executor::new(&config.name, registry.clone(), observability.clone(), config.max_retry_delay),
            state: state.clone(),
            concurrency: config.concurrency,
            tick: config.poll_interval,
            ready: VecDeque::new(),
            delayed: Vec::new(),
            tasks: JoinSet::new(),
            idle_waiters: Vec::new(),
            stopped: false,
        };
        tokio::spawn(supervisor.run(receiver));

        debug!(queue = %config.name, concurrency = config.concurrency, "Ephemeral queue started");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                observability,
                state,
                commands,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
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

    #[instrument(skip(self, payload, options), fields(queue = %self.inner.config.name))]
    pub async fn enqueue(&self, job_type: &str, payload: Payload, options: EnqueueOptions) -> QueueResult<JobId> {
        self.inner.registry.ensure_registered(job_type)?;

        let policy = options.resolve(&self.inner.config.retry)?;
        let record = JobRecord::new(job_type, payload, policy);
        let job_id = record.id.clone();

        self.inner.state.write().jobs.insert(
            job_id.clone(),
            EphemeralJob {
                record: record.clone(),
                result: None,
            },
        );
        self.inner.observability.record_enqueued(&record);
        debug!(job_id = %job_id, job_type = %job_type, "Job enqueued");

        let _ = self.inner.commands.send(Command::Enqueued(record));
        Ok(job_id)
    }

    /// Enqueue a typed job with its own options
    pub async fn enqueue_job<J: Job>(&self, job: &J) -> QueueResult<JobId> {
        let payload = encode_payload(job)?;
        self.enqueue(J::JOB_TYPE, payload, job.options()).await
    }

    /// Resolve once nothing is queued or running; delayed retries are not waited for
    pub async fn wait_for_idle(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.commands.send(Command::WaitIdle(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Stop dispatching and drop queued and delayed jobs
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.commands.send(Command::Stop);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn job(&self, id: &JobId) -> Option<EphemeralJob> {
        self.inner.state.read().jobs.get(id).cloned()
    }

    /// Permanently failed jobs, in the order they failed
    pub fn dead_letters(&self) -> Vec<EphemeralJob> {
        let state = self.inner.state.read();
        state
            .dead_letters
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    pub fn metrics(&self) -> QueueMetrics {
        let mut counts = StatusCounts::default();
        for job in self.inner.state.read().jobs.values() {
            counts.add(job.record.status, 1);
        }
        self.inner.observability.snapshot("memory", counts)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.observability.subscribe()
    }

    pub fn event_stream(&self) -> BoxStream<JobEvent> {
        self.inner.observability.event_stream()
    }
}

#[async_trait]
impl JobQueue for EphemeralQueue {
    fn name(&self) -> &str {
        EphemeralQueue::name(self)
    }

    async fn enqueue(&self, job_type: &str, payload: Payload, options: EnqueueOptions) -> QueueResult<JobId> {
        EphemeralQueue::enqueue(self, job_type, payload, options).await
    }

    async fn wait_for_idle(&self) {
        EphemeralQueue::wait_for_idle(self).await
    }

    fn stop(&self) {
        EphemeralQueue::stop(self)
    }

    async fn metrics(&self) -> QueueResult<QueueMetrics> {
        Ok(EphemeralQueue::metrics(self))
    }
}

struct Supervisor {
    name: String,
    executor: Executor,
    state: SharedState,
    concurrency: usize,
    tick: Duration,
    ready: VecDeque<JobRecord>,

    /// Retries waiting for their `available_at`
    delayed: Vec<JobRecord>,

    tasks: JoinSet<Option<JobRecord>>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    stopped: bool,
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut open = true;

        loop {
            self.dispatch();
            self.release_idle_waiters();

            if !open && self.tasks.is_empty() {
                break;
            }

            tokio::select! {
                command = commands.recv(), if open => match command {
                    Some(Command::Enqueued(record)) => {
                        if !self.stopped {
                            self.push_ready(record);
                        }
                    }
                    Some(Command::WaitIdle(waiter)) => self.idle_waiters.push(waiter),
                    Some(Command::Stop) => self.stop(),
                    None => {
                        open = false;
                        self.stop();
                    }
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => self.reap(joined),
                _ = tick.tick(), if !self.stopped && !self.delayed.is_empty() => self.promote_due(),
            }
        }

        self.release_idle_waiters();
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.ready.clear();
        self.delayed.clear();
        info!(queue = %self.name, in_flight = self.tasks.len(), "Queue stopped");
    }

    fn push_ready(&mut self, record: JobRecord) {
        let key = record.availability_key();
        let position = self.ready.partition_point(|queued| queued.availability_key() <= key);
        self.ready.insert(position, record);
    }

    fn promote_due(&mut self) {
        let now = now();
        let (due, waiting): (Vec<_>, Vec<_>) = self.delayed.drain(..).partition(|r| r.is_due(now));
        self.delayed = waiting;
        for record in due {
            self.push_ready(record);
        }
    }

    fn dispatch(&mut self) {
        if self.stopped {
            return;
        }

        while self.tasks.len() < self.concurrency {
            let Some(record) = self.ready.pop_front() else {
                break;
            };
            let job = execute(self.state.clone(), self.executor.clone(), record);
            self.tasks
                .spawn(AssertUnwindSafe(job).catch_unwind().map(|finished| finished.ok().flatten()));
        }
    }

    fn reap(&mut self, joined: Result<Option<JobRecord>, JoinError>) {
        match joined {
            Ok(Some(record)) if record.status == JobStatus::Pending && !self.stopped => {
                self.delayed.push(record);
            }
            Ok(_) => {}
            Err(e) => error!(queue = %self.name, error = %e, "Job task aborted"),
        }
    }

    fn release_idle_waiters(&mut self) {
        if self.idle_waiters.is_empty() || !self.ready.is_empty() || !self.tasks.is_empty() {
            return;
        }

        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

async fn execute(state: SharedState, executor: Executor, mut record: JobRecord) -> Option<JobRecord> {
    record.mark_running();
    if let Some(job) = state.write().jobs.get_mut(&record.id) {
        job.record = record.clone();
    }

    let settled = executor.run(&mut record).await;

    let mut state = state.write();
    let failed = settled == Settled::Failed;
    if let Some(job) = state.jobs.get_mut(&record.id) {
        job.record = record.clone();
        if let Settled::Completed(value) = settled {
            job.result = value;
        }
    }
    if failed {
        state.dead_letters.push(record.id.clone());
    }

    Some(record)
}
