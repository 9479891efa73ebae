use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{Job, JobMeta};
use crate::{JobError, Payload, QueueError, QueueResult};

/// Type-erased job handler for runtime dispatch
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt of a job. `Ok` carries the (optional) result value.
    async fn handle(&self, payload: Payload, meta: JobMeta) -> Result<Option<Value>, JobError>;
}

fn encode_output<R: Serialize>(output: &R) -> Result<Option<Value>, JobError> {
    match serde_json::to_value(output) {
        Ok(Value::Null) => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(JobError::permanent(format!("Failed to serialize job result: {}", e))),
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F, R> {
    f: F,
    _output: PhantomData<fn() -> R>,
}

/// Wrap an async closure `(payload, meta) -> Result<R, JobError>` as a handler
pub fn handler_fn<F, Fut, R>(f: F) -> FnHandler<F, R>
where
    F: Fn(Payload, JobMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, JobError>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    FnHandler {
        f,
        _output: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, R> JobHandler for FnHandler<F, R>
where
    F: Fn(Payload, JobMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, JobError>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    async fn handle(&self, payload: Payload, meta: JobMeta) -> Result<Option<Value>, JobError> {
        let output = (self.f)(payload, meta).await?;
        encode_output(&output)
    }
}

/// Handler that decodes the payload into a typed [`Job`]
pub struct TypedHandler<J: Job> {
    context: J::Context,
}

impl<J: Job> TypedHandler<J> {
    pub fn new(context: J::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl<J: Job> JobHandler for TypedHandler<J> {
    async fn handle(&self, payload: Payload, meta: JobMeta) -> Result<Option<Value>, JobError> {
        let job: J = serde_json::from_value(Value::Object(payload)).map_err(|e| {
            JobError::permanent(format!("Failed to deserialize {} payload: {}", J::JOB_TYPE, e))
        })?;

        let output = job.execute(&meta, self.context.clone()).await?;
        encode_output(&output)
    }
}

/// Registry mapping job types to their handlers.
///
/// Cloning shares the underlying map, so registrations made through any
/// clone are visible to the queue that owns it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for the same type
    pub fn register(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        if self.handlers.write().insert(job_type.clone(), handler).is_some() {
            debug!(job_type = %job_type, "Replaced job handler");
        } else {
            debug!(job_type = %job_type, "Registered job handler");
        }
    }

    /// Remove a handler; jobs of this type already queued fail permanently
    pub fn unregister(&self, job_type: &str) -> bool {
        self.handlers.write().remove(job_type).is_some()
    }

    /// Look up the handler for a job type
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(job_type).cloned()
    }

    /// Check if a job type is registered
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.read().contains_key(job_type)
    }

    /// Fail with `HandlerNotRegistered` unless the type has a handler
    pub fn ensure_registered(&self, job_type: &str) -> QueueResult<()> {
        if self.is_registered(job_type) {
            Ok(())
        } else {
            Err(QueueError::HandlerNotRegistered(job_type.to_string()))
        }
    }

    /// Get all registered job types, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}
