use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{QueueError, QueueResult};

/// Longest delay a retry can be pushed out by (fits a millisecond timestamp column)
const MAX_DELAY_MS: f64 = i64::MAX as f64;

/// Exponential backoff schedule attached to every job
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    pub retry_delay_ms: u64,

    /// Multiplier applied per additional attempt
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy from explicit parameters
    pub fn new(max_retries: u32, retry_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            retry_delay_ms: retry_delay.as_millis().min(u64::MAX as u128) as u64,
            backoff_factor,
        }
    }

    /// Delay applied after the given failed attempt (1-based):
    /// `retry_delay_ms * backoff_factor^(attempt - 1)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.retry_delay_ms as f64 * self.backoff_factor.powi(exponent);

        if millis.is_nan() || millis <= 0.0 {
            Duration::ZERO
        } else if millis >= MAX_DELAY_MS {
            Duration::from_millis(i64::MAX as u64)
        } else {
            Duration::from_millis(millis.round() as u64)
        }
    }

    /// Whether another attempt is allowed once `attempts` failures have been recorded
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    /// Reject factors that would produce a meaningless schedule
    pub fn validate(&self) -> QueueResult<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 0.0 {
            return Err(QueueError::invalid_config(format!(
                "backoff_factor must be a finite, non-negative number (got {})",
                self.backoff_factor
            )));
        }
        Ok(())
    }
}

/// Per-job overrides of the queue's retry defaults
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnqueueOptions {
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub backoff_factor: Option<f64>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the maximum retry count
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Override the base retry delay
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Override the backoff multiplier
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = Some(factor);
        self
    }

    /// Merge these overrides onto the queue defaults
    pub fn resolve(&self, defaults: &RetryPolicy) -> QueueResult<RetryPolicy> {
        let policy = RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay_ms: self
                .retry_delay
                .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
                .unwrap_or(defaults.retry_delay_ms),
            backoff_factor: self.backoff_factor.unwrap_or(defaults.backoff_factor),
        };
        policy.validate()?;
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_retry_allowance() {
        let policy = RetryPolicy::default();

        assert!(policy.allows_retry(3));
        assert!(!policy.allows_retry(4));
    }

    #[test]
    fn test_options_override_defaults() {
        let options = EnqueueOptions::new()
            .with_max_retries(5)
            .with_backoff_factor(3.0);

        let policy = options.resolve(&RetryPolicy::default()).unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.retry_delay_ms, 1000);
        assert_eq!(policy.backoff_factor, 3.0);
    }

    #[test]
    fn test_invalid_factor_rejected() {
        let options = EnqueueOptions::new().with_backoff_factor(f64::NAN);
        assert!(matches!(
            options.resolve(&RetryPolicy::default()),
            Err(QueueError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_huge_exponent_saturates() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(1), 10.0);
        assert_eq!(policy.delay_for(500), Duration::from_millis(i64::MAX as u64));
    }

    proptest! {
        #[test]
        fn delay_matches_formula(base in 1u64..10_000, factor in 1.0f64..4.0, attempt in 1u32..8) {
            let policy = RetryPolicy { max_retries: 10, retry_delay_ms: base, backoff_factor: factor };
            let expected = (base as f64 * factor.powi(attempt as i32 - 1)).round() as u64;
            prop_assert_eq!(policy.delay_for(attempt), Duration::from_millis(expected));
        }

        #[test]
        fn delay_never_shrinks_with_factor_at_least_one(base in 0u64..10_000, factor in 1.0f64..4.0, attempt in 1u32..30) {
            let policy = RetryPolicy { max_retries: 40, retry_delay_ms: base, backoff_factor: factor };
            prop_assert!(policy.delay_for(attempt + 1) >= policy.delay_for(attempt));
        }
    }
}
