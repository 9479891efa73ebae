use std::str::FromStr;
use std::time::Duration;

use crate::{EnqueueOptions, Payload, QueueError, QueueResult, RetryPolicy};

/// Parse `key` from `lookup`, falling back to `default` when missing or malformed
fn var_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Configuration for a job queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Label attached to every log event of this queue
    pub name: String,

    /// Maximum number of handlers running at once
    pub concurrency: usize,

    /// How often the store is scanned for due jobs
    pub poll_interval: Duration,

    /// Maximum rows fetched per scan
    pub poll_batch_size: usize,

    /// Retry parameters used when an enqueue does not override them
    pub retry: RetryPolicy,

    /// Upper bound on a single backoff delay (unbounded when `None`)
    pub max_retry_delay: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "jobs".to_string(),
            concurrency: 2,
            poll_interval: Duration::from_millis(250),
            poll_batch_size: 50,
            retry: RetryPolicy::default(),
            max_retry_delay: None,
        }
    }
}

impl QueueConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `QUEUE_*` variables, keeping defaults for anything unset or unparsable
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let retry = RetryPolicy {
            max_retries: var_or(&lookup, "QUEUE_MAX_RETRIES", defaults.retry.max_retries),
            retry_delay_ms: var_or(&lookup, "QUEUE_RETRY_DELAY_MS", defaults.retry.retry_delay_ms),
            backoff_factor: var_or(&lookup, "QUEUE_BACKOFF_FACTOR", defaults.retry.backoff_factor),
        };

        Self {
            name: lookup("QUEUE_NAME").unwrap_or(defaults.name),
            concurrency: var_or(&lookup, "QUEUE_CONCURRENCY", defaults.concurrency),
            poll_interval: Duration::from_millis(var_or(&lookup, "QUEUE_POLL_INTERVAL_MS", 250u64)),
            poll_batch_size: var_or(&lookup, "QUEUE_POLL_BATCH_SIZE", defaults.poll_batch_size),
            retry,
            max_retry_delay: lookup("QUEUE_MAX_RETRY_DELAY_MS")
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_millis),
        }
    }

    /// Set the queue name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set max concurrent handlers
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the poll batch size
    pub fn with_poll_batch_size(mut self, size: usize) -> Self {
        self.poll_batch_size = size;
        self
    }

    /// Set the default retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Cap individual backoff delays
    pub fn with_max_retry_delay(mut self, cap: Duration) -> Self {
        self.max_retry_delay = Some(cap);
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.concurrency == 0 {
            return Err(QueueError::invalid_config("concurrency must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(QueueError::invalid_config("poll_interval must be greater than zero"));
        }
        if self.poll_batch_size == 0 {
            return Err(QueueError::invalid_config("poll_batch_size must be at least 1"));
        }
        self.retry.validate()
    }
}

/// Configuration for a recurring job
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub name: String,

    /// Time between enqueues after the immediate first one
    pub interval: Duration,

    /// Payload enqueued on every tick
    pub payload: Payload,

    pub options: EnqueueOptions,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "scheduler".to_string(),
            interval: Duration::from_secs(6 * 60 * 60),
            payload: Payload::new(),
            options: EnqueueOptions::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `SCHEDULER_INTERVAL_MS`
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let interval_ms = var_or(&lookup, "SCHEDULER_INTERVAL_MS", defaults.interval.as_millis() as u64);

        Self {
            interval: Duration::from_millis(interval_ms),
            ..defaults
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.interval.is_zero() {
            return Err(QueueError::invalid_config("scheduler interval must be greater than zero"));
        }
        Ok(())
    }
}

/// Configuration for a token-bucket limiter
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub name: String,

    /// Bucket capacity, restored in full every window
    pub calls_per_window: u32,

    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            name: "rate-limiter".to_string(),
            calls_per_window: 12,
            window: Duration::from_millis(60_000),
        }
    }
}

impl RateLimiterConfig {
    pub fn new(calls_per_window: u32, window: Duration) -> Self {
        Self {
            calls_per_window,
            window,
            ..Self::default()
        }
    }

    /// Read `RATE_LIMIT_CALLS_PER_WINDOW` and `RATE_LIMIT_WINDOW_MS`
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            calls_per_window: var_or(&lookup, "RATE_LIMIT_CALLS_PER_WINDOW", defaults.calls_per_window),
            window: Duration::from_millis(var_or(&lookup, "RATE_LIMIT_WINDOW_MS", 60_000u64)),
            ..defaults
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.calls_per_window == 0 {
            return Err(QueueError::invalid_config("calls_per_window must be at least 1"));
        }
        if self.window.is_zero() {
            return Err(QueueError::invalid_config("window must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_queue_defaults() {
        let config = QueueConfig::default();

        assert_eq!(config.concurrency, 2);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.poll_batch_size, 50);
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(config.max_retry_delay.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_queue_from_env_with_garbage() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("QUEUE_CONCURRENCY", "4"),
            ("QUEUE_POLL_INTERVAL_MS", "not-a-number"),
            ("QUEUE_RETRY_DELAY_MS", " 500 "),
        ]));

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.retry.retry_delay_ms, 500);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = QueueConfig::new().with_concurrency(0);
        assert!(matches!(config.validate(), Err(QueueError::InvalidConfig(_))));
    }

    #[test]
    fn test_scheduler_defaults_to_six_hours() {
        assert_eq!(SchedulerConfig::default().interval, Duration::from_secs(21_600));

        let config = SchedulerConfig::from_lookup(lookup(&[("SCHEDULER_INTERVAL_MS", "1000")]));
        assert_eq!(config.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_rate_limiter_env() {
        let config = RateLimiterConfig::from_lookup(lookup(&[]));
        assert_eq!(config.calls_per_window, 12);
        assert_eq!(config.window, Duration::from_secs(60));

        let config = RateLimiterConfig::from_lookup(lookup(&[
            ("RATE_LIMIT_CALLS_PER_WINDOW", "3"),
            ("RATE_LIMIT_WINDOW_MS", "1000"),
        ]));
        assert_eq!(config.calls_per_window, 3);
        assert_eq!(config.window, Duration::from_secs(1));
        assert!(RateLimiterConfig::new(0, Duration::from_secs(1)).validate().is_err());
    }
}
