use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{JobId, RetryPolicy};
use crate::JobError;

/// Opaque job payload handed verbatim to the handler
pub type Payload = serde_json::Map<String, Value>;

/// Current time truncated to the millisecond precision the stores persist
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

/// Job status lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for `available_at` and a free worker slot
    Pending,

    /// Handed to a worker
    Running,

    /// Handler succeeded
    Completed,

    /// Retries exhausted or permanent error
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Get the status name as stored
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// What a recorded failure did to the job
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Rescheduled as pending after `delay`
    Retry {
        attempt: u32,
        delay: Duration,
        retry_at: DateTime<Utc>,
    },

    /// `attempts` exceeded `max_retries`
    Exhausted { attempts: u32 },

    /// Handler reported a permanent error
    Rejected { attempts: u32 },
}

impl FailureOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Retry { .. })
    }
}

/// Job record - the persisted state of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: String,
    pub payload: Payload,
    pub attempts: u32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_factor: f64,
    pub status: JobStatus,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Message of the most recent handler failure
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Create a pending job that is available immediately
    pub fn new(job_type: impl Into<String>, payload: Payload, policy: RetryPolicy) -> Self {
        let now = now();

        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            attempts: 0,
            max_retries: policy.max_retries,
            retry_delay_ms: policy.retry_delay_ms,
            backoff_factor: policy.backoff_factor,
            status: JobStatus::Pending,
            available_at: now,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Backoff schedule stored on this job
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            backoff_factor: self.backoff_factor,
        }
    }

    /// Check if the job may be picked up at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now
    }

    /// Ordering key used by the ready list and the store queries
    pub fn availability_key(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.available_at, self.created_at)
    }

    /// Hand the job to a worker
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.updated_at = now();
    }

    /// Put an interrupted job back in line without counting an attempt
    pub fn reset_to_pending(&mut self) {
        self.status = JobStatus::Pending;
        self.updated_at = now();
    }

    /// Complete the job successfully
    pub fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.updated_at = now();
    }

    /// Fail the job permanently without consulting the retry policy
    pub fn fail(&mut self, error: impl Into<String>) {
        self.attempts = self.attempts.saturating_add(1);
        self.status = JobStatus::Failed;
        self.last_error = Some(error.into());
        self.updated_at = now();
    }

    /// Count a failed attempt and either reschedule or fail the job.
    ///
    /// `max_delay` caps the computed backoff when set.
    pub fn record_failure(&mut self, error: &JobError, max_delay: Option<Duration>) -> FailureOutcome {
        let now = now();
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.message().to_string());
        self.updated_at = now;

        if !error.is_retryable() {
            self.status = JobStatus::Failed;
            return FailureOutcome::Rejected { attempts: self.attempts };
        }

        let policy = self.policy();
        if !policy.allows_retry(self.attempts) {
            self.status = JobStatus::Failed;
            return FailureOutcome::Exhausted { attempts: self.attempts };
        }

        let mut delay = policy.delay_for(self.attempts);
        if let Some(cap) = max_delay {
            delay = delay.min(cap);
        }

        let millis = delay.as_millis().min(i64::MAX as u128) as i64;
        let retry_at = chrono::Duration::try_milliseconds(millis)
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.status = JobStatus::Pending;
        self.available_at = retry_at;

        FailureOutcome::Retry {
            attempt: self.attempts,
            delay,
            retry_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(max_retries: u32) -> JobRecord {
        JobRecord::new(
            "download_ticket",
            Payload::new(),
            RetryPolicy::new(max_retries, Duration::from_millis(1000), 2.0),
        )
    }

    #[test]
    fn test_new_record_is_pending_and_due() {
        let record = record(3);

        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.is_due(now()));
    }

    #[test]
    fn test_failures_follow_backoff_then_exhaust() {
        let mut record = record(2);
        let error = JobError::retryable("portal timeout");

        let first = record.record_failure(&error, None);
        assert!(matches!(first, FailureOutcome::Retry { attempt: 1, delay, .. } if delay == Duration::from_millis(1000)));
        assert_eq!(record.status, JobStatus::Pending);

        let second = record.record_failure(&error, None);
        assert!(matches!(second, FailureOutcome::Retry { attempt: 2, delay, .. } if delay == Duration::from_millis(2000)));

        let third = record.record_failure(&error, None);
        assert_eq!(third, FailureOutcome::Exhausted { attempts: 3 });
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some("portal timeout"));
    }

    #[test]
    fn test_retry_pushes_available_at() {
        let mut record = record(3);
        let before = record.available_at;

        record.record_failure(&JobError::retryable("503"), None);
        assert!(record.available_at >= before + chrono::Duration::milliseconds(1000));
    }

    #[test]
    fn test_max_delay_caps_backoff() {
        let mut record = record(5);
        record.attempts = 4;

        let outcome = record.record_failure(&JobError::retryable("503"), Some(Duration::from_millis(1500)));
        assert!(matches!(outcome, FailureOutcome::Retry { delay, .. } if delay == Duration::from_millis(1500)));
    }

    #[test]
    fn test_permanent_error_skips_retries() {
        let mut record = record(3);

        let outcome = record.record_failure(&JobError::permanent("unknown ticket"), None);
        assert_eq!(outcome, FailureOutcome::Rejected { attempts: 1 });
        assert_eq!(record.status, JobStatus::Failed);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [JobStatus::Pending, JobStatus::Running, JobStatus::Completed, JobStatus::Failed] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<JobStatus>().is_err());
    }
}
