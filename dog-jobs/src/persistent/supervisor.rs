use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::execution::Executor;
use crate::store::JobStore;
use crate::types::record::now;
use crate::{JobId, JobRecord, JobStatus};

pub(crate) enum Command {
    Enqueued(JobRecord),
    WaitIdle(oneshot::Sender<()>),
    Stop,
}

/// Sole owner of the ready list and the in-flight task set
pub(crate) struct Supervisor {
    name: String,
    store: Arc<dyn JobStore>,
    executor: Executor,
    concurrency: usize,
    poll_interval: Duration,
    poll_batch_size: usize,

    /// Jobs waiting for a worker slot, ordered by (available_at, created_at)
    ready: VecDeque<JobRecord>,

    /// Ids currently in `ready` or executing
    known: HashSet<JobId>,

    tasks: JoinSet<JobId>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    stopped: bool,
}

impl Supervisor {
    pub(crate) fn new(
        name: String,
        store: Arc<dyn JobStore>,
        executor: Executor,
        concurrency: usize,
        poll_interval: Duration,
        poll_batch_size: usize,
    ) -> Self {
        Self {
            name,
            store,
            executor,
            concurrency,
            poll_interval,
            poll_batch_size,
            ready: VecDeque::new(),
            known: HashSet::new(),
            tasks: JoinSet::new(),
            idle_waiters: Vec::new(),
            stopped: false,
        }
    }

    /// Load rows left behind by a previous process.
    ///
    /// `running` rows were interrupted mid-attempt and go back to `pending`
    /// without counting an attempt. Rows not yet due stay with the poller.
    pub(crate) async fn recover(&mut self, rows: Vec<JobRecord>) -> usize {
        let now = now();
        let mut recovered = 0;

        for mut record in rows {
            if record.status.is_terminal() {
                continue;
            }

            if record.status == JobStatus::Running {
                record.reset_to_pending();
                if let Err(e) = self.store.update(&record).await {
                    error!(queue = %self.name, job_id = %record.id, error = %e, "Failed to reset interrupted job");
                    continue;
                }
                info!(queue = %self.name, job_id = %record.id, job_type = %record.job_type, "Recovered interrupted job");
            }

            if record.is_due(now) {
                self.push_ready(record);
            }
            recovered += 1;
        }

        recovered
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut open = true;

        // Commands sent before `start` (including a stop) apply before the
        // first dispatch of recovered jobs
        while let Ok(command) = commands.try_recv() {
            self.handle(command);
        }

        debug!(queue = %self.name, concurrency = self.concurrency, "Supervisor started");

        loop {
            self.dispatch();
            self.release_idle_waiters();

            if !open && self.tasks.is_empty() {
                break;
            }

            tokio::select! {
                command = commands.recv(), if open => match command {
                    Some(command) => self.handle(command),
                    None => {
                        open = false;
                        self.stop();
                    }
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => self.reap(joined),
                _ = poll.tick(), if !self.stopped => self.poll().await,
            }
        }

        self.release_idle_waiters();
        debug!(queue = %self.name, "Supervisor exited");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueued(record) => {
                if !self.stopped {
                    self.push_ready(record);
                }
            }
            Command::WaitIdle(waiter) => self.idle_waiters.push(waiter),
            Command::Stop => self.stop(),
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        for record in self.ready.drain(..) {
            self.known.remove(&record.id);
        }
        info!(queue = %self.name, in_flight = self.tasks.len(), "Queue stopped");
    }

    /// Insert in availability order unless the job is already queued or running
    fn push_ready(&mut self, record: JobRecord) {
        if !self.known.insert(record.id.clone()) {
            return;
        }

        let key = record.availability_key();
        let position = self.ready.partition_point(|queued| queued.availability_key() <= key);
        self.ready.insert(position, record);
    }

    fn dispatch(&mut self) {
        if self.stopped {
            return;
        }

        let now = now();
        while self.tasks.len() < self.concurrency {
            match self.ready.front() {
                Some(record) if record.is_due(now) => {}
                _ => break,
            }
            let Some(record) = self.ready.pop_front() else {
                break;
            };

            debug!(queue = %self.name, job_id = %record.id, job_type = %record.job_type, "Dispatching job");

            let id = record.id.clone();
            let job = execute(self.store.clone(), self.executor.clone(), record);
            self.tasks
                .spawn(AssertUnwindSafe(job).catch_unwind().map(move |finished| finished.unwrap_or(id)));
        }
    }

    fn reap(&mut self, joined: Result<JobId, JoinError>) {
        match joined {
            Ok(id) => {
                self.known.remove(&id);
            }
            Err(e) => error!(queue = %self.name, error = %e, "Job task aborted"),
        }
    }

    async fn poll(&mut self) {
        match self.store.due(now(), self.poll_batch_size).await {
            Ok(rows) => {
                for record in rows {
                    self.push_ready(record);
                }
            }
            Err(e) => warn!(queue = %self.name, error = %e, "Polling for due jobs failed"),
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

/// Run one attempt and persist every transition
async fn execute(store: Arc<dyn JobStore>, executor: Executor, mut record: JobRecord) -> JobId {
    let id = record.id.clone();

    record.mark_running();
    if let Err(e) = store.update(&record).await {
        error!(job_id = %id, error = %e, "Failed to mark job running");
        return id;
    }

    executor.run(&mut record).await;

    if let Err(e) = store.update(&record).await {
        error!(job_id = %id, status = %record.status, error = %e, "Failed to persist job outcome");
    }

    id
}
