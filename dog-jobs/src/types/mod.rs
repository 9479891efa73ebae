pub mod ids;
pub mod policy;
pub mod record;
pub mod events;

pub use ids::JobId;
pub use policy::{EnqueueOptions, RetryPolicy};
pub use record::{FailureOutcome, JobRecord, JobStatus, Payload};
pub use events::JobEvent;
