//! Token-bucket rate limiter.
//!
//! The bucket holds `calls_per_window` tokens and is refilled to full
//! capacity once per window. Callers that find it empty queue up and are
//! granted tokens strictly in arrival order at the next refill.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::config::RateLimiterConfig;
use crate::QueueResult;

/// Snapshot of limiter state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub capacity: u32,
    pub window_ms: u64,
    pub available: u32,

    /// Callers currently queued for a token
    pub waiting: usize,

    pub acquired: u64,

    /// Acquisitions that had to wait for a refill
    pub delayed: u64,

    /// Mean wait of delayed acquisitions
    pub avg_wait_ms: f64,
}

struct Waiter {
    tx: oneshot::Sender<()>,
    requested_at: Instant,
}

struct Bucket {
    tokens: u32,
    last_refill: Instant,
    waiters: VecDeque<Waiter>,
    acquired: u64,
    delayed: u64,
    total_wait: Duration,
}

struct Shared {
    name: String,
    capacity: u32,
    window: Duration,
    bucket: Mutex<Bucket>,
    refill_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// Reset to full capacity and hand tokens to queued callers in order
    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        bucket.tokens = self.capacity;
        bucket.last_refill = now;

        while bucket.tokens > 0 {
            let Some(waiter) = bucket.waiters.pop_front() else {
                break;
            };

            // A caller that gave up is skipped without spending a token
            if waiter.tx.send(()).is_ok() {
                bucket.tokens -= 1;
                bucket.acquired += 1;
                bucket.delayed += 1;
                bucket.total_wait += now.saturating_duration_since(waiter.requested_at);
            }
        }
    }

    fn refill_if_due(&self, bucket: &mut Bucket, now: Instant) {
        if now.saturating_duration_since(bucket.last_refill) >= self.window {
            self.refill(bucket, now);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(task) = self.refill_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Token-bucket limiter shared by cloning
#[derive(Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl RateLimiter {
    /// Create a full bucket and start its refill timer on the current Tokio runtime
    pub fn new(config: RateLimiterConfig) -> QueueResult<Self> {
        config.validate()?;

        let now = Instant::now();
        let shared = Arc::new(Shared {
            name: config.name,
            capacity: config.calls_per_window,
            window: config.window,
            bucket: Mutex::new(Bucket {
                tokens: config.calls_per_window,
                last_refill: now,
                waiters: VecDeque::new(),
                acquired: 0,
                delayed: 0,
                total_wait: Duration::ZERO,
            }),
            refill_task: Mutex::new(None),
        });

        let task = tokio::spawn(refill_loop(Arc::downgrade(&shared), now, config.window));
        *shared.refill_task.lock() = Some(task);

        debug!(
            limiter = %shared.name,
            capacity = shared.capacity,
            window_ms = shared.window.as_millis() as u64,
            "Rate limiter started"
        );

        Ok(Self { shared })
    }

    /// Build from `RATE_LIMIT_CALLS_PER_WINDOW` / `RATE_LIMIT_WINDOW_MS`
    pub fn from_env() -> QueueResult<Self> {
        Self::new(RateLimiterConfig::from_env())
    }

    /// Take one token, waiting for a refill if none is available.
    ///
    /// If the limiter is dropped while waiting, this returns without a token.
    pub async fn acquire(&self) {
        let rx = {
            let mut bucket = self.shared.bucket.lock();
            let now = Instant::now();
            self.shared.refill_if_due(&mut bucket, now);

            if bucket.tokens > 0 && bucket.waiters.is_empty() {
                bucket.tokens -= 1;
                bucket.acquired += 1;
                return;
            }

            let (tx, rx) = oneshot::channel();
            bucket.waiters.push_back(Waiter { tx, requested_at: now });
            debug!(limiter = %self.shared.name, waiting = bucket.waiters.len(), "Rate limit reached, waiting for refill");
            rx
        };

        let _ = rx.await;
    }

    /// Take a token only if one is free right now
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.shared.bucket.lock();
        self.shared.refill_if_due(&mut bucket, Instant::now());

        if bucket.tokens > 0 && bucket.waiters.is_empty() {
            bucket.tokens -= 1;
            bucket.acquired += 1;
            true
        } else {
            false
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let bucket = self.shared.bucket.lock();
        let avg_wait_ms = if bucket.delayed == 0 {
            0.0
        } else {
            bucket.total_wait.as_secs_f64() * 1000.0 / bucket.delayed as f64
        };

        RateLimiterStats {
            capacity: self.shared.capacity,
            window_ms: self.shared.window.as_millis() as u64,
            available: bucket.tokens,
            waiting: bucket.waiters.len(),
            acquired: bucket.acquired,
            delayed: bucket.delayed,
            avg_wait_ms,
        }
    }

    /// Cancel the refill timer. Queued callers stay queued; only an overdue
    /// refill triggered by a later `acquire` can release them.
    pub fn stop(&self) {
        if let Some(task) = self.shared.refill_task.lock().take() {
            task.abort();
            debug!(limiter = %self.shared.name, "Rate limiter stopped");
        }
    }
}

async fn refill_loop(shared: Weak<Shared>, start: Instant, window: Duration) {
    let mut ticker = tokio::time::interval_at(start + window, window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(shared) = shared.upgrade() else {
            break;
        };
        let mut bucket = shared.bucket.lock();
        shared.refill(&mut bucket, Instant::now());
    }
}
