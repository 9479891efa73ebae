pub mod registry;

pub use registry::{handler_fn, FnHandler, HandlerRegistry, JobHandler, TypedHandler};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{EnqueueOptions, JobError, JobId, JobRecord, Payload, QueueError, QueueResult};

/// Metadata handed to a handler alongside the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    pub id: JobId,
    pub job_type: String,

    /// 1-based number of the attempt being executed
    pub attempt: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl JobMeta {
    pub(crate) fn from_record(record: &JobRecord) -> Self {
        Self {
            id: record.id.clone(),
            job_type: record.job_type.clone(),
            attempt: record.attempts.saturating_add(1),
            max_retries: record.max_retries,
            created_at: record.created_at,
        }
    }

    /// True when a failure of this attempt will not be retried
    pub fn is_last_attempt(&self) -> bool {
        self.attempt > self.max_retries
    }
}

/// Typed job whose payload is its own serialized form
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Context type passed to job execution
    type Context: Send + Sync + Clone + 'static;

    /// Value returned by a successful run
    type Output: Serialize + Send + 'static;

    /// Job type identifier for dispatch
    const JOB_TYPE: &'static str;

    /// Maximum retry attempts
    const MAX_RETRIES: u32 = 3;

    /// Execute the job with the given context
    async fn execute(&self, meta: &JobMeta, ctx: Self::Context) -> Result<Self::Output, JobError>;

    /// Options used by `enqueue_job` (default: `MAX_RETRIES`, queue defaults otherwise)
    fn options(&self) -> EnqueueOptions {
        EnqueueOptions::new().with_max_retries(Self::MAX_RETRIES)
    }
}

/// Serialize a typed job into the payload map stored with the record
pub fn encode_payload<J: Serialize>(job: &J) -> QueueResult<Payload> {
    match serde_json::to_value(job)? {
        Value::Object(map) => Ok(map),
        other => Err(QueueError::Serialization(format!(
            "job payload must serialize to a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
