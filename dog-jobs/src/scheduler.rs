use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

use crate::config::SchedulerConfig;
use crate::queue::JobQueue;
use crate::QueueResult;

/// Handle for the running schedule loop
struct ScheduleHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

/// Enqueues one job type on a fixed interval.
///
/// `start` enqueues once right away, then once per interval until `stop`.
/// Failed enqueues are logged and the schedule keeps going.
pub struct JobScheduler {
    queue: Arc<dyn JobQueue>,
    job_type: String,
    config: SchedulerConfig,
    handle: Mutex<Option<ScheduleHandle>>,
}

impl JobScheduler {
    pub fn new(queue: Arc<dyn JobQueue>, job_type: impl Into<String>, config: SchedulerConfig) -> QueueResult<Self> {
        config.validate()?;

        Ok(Self {
            queue,
            job_type: job_type.into(),
            config,
            handle: Mutex::new(None),
        })
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|handle| !handle.join_handle.is_finished())
            .unwrap_or(false)
    }

    /// Start the schedule; no-op when already running
    #[instrument(skip(self), fields(scheduler = %self.config.name, job_type = %self.job_type))]
    pub async fn start(&self) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        {
            let mut guard = self.handle.lock();
            if guard.is_some() {
                debug!("Scheduler already running");
                return;
            }

            let tick = Tick {
                queue: self.queue.clone(),
                job_type: self.job_type.clone(),
                config: self.config.clone(),
            };
            let join_handle = tokio::spawn(tick.run(shutdown_rx));
            *guard = Some(ScheduleHandle {
                shutdown_tx,
                join_handle,
            });
        }

        info!(interval_ms = self.config.interval.as_millis() as u64, "Scheduler started");

        // The loop's first tick is one interval out; this is the immediate one.
        fire(&*self.queue, &self.job_type, &self.config).await;
    }

    /// Cancel the timer. Jobs already enqueued are unaffected.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.shutdown_tx.send(());
            info!(scheduler = %self.config.name, job_type = %self.job_type, "Scheduler stopped");
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.join_handle.abort();
        }
    }
}

struct Tick {
    queue: Arc<dyn JobQueue>,
    job_type: String,
    config: SchedulerConfig,
}

impl Tick {
    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) {
        let interval = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => fire(&*self.queue, &self.job_type, &self.config).await,
            }
        }
    }
}

async fn fire(queue: &dyn JobQueue, job_type: &str, config: &SchedulerConfig) {
    match queue.enqueue(job_type, config.payload.clone(), config.options).await {
        Ok(job_id) => info!(
            scheduler = %config.name,
            queue = queue.name(),
            job_id = %job_id,
            job_type,
            "Scheduled job enqueued"
        ),
        Err(e) => error!(
            scheduler = %config.name,
            queue = queue.name(),
            job_type,
            error = %e,
            "Failed to enqueue scheduled job"
        ),
    }
}
