//! In-process job queues with retry, backoff, and per-queue concurrency.

mod dispatcher;
mod job;

pub use dispatcher::{Dispatcher, DispatcherConfig, JobError, JobEvent, JobHandler};
pub use job::{Backoff, EnqueueOptions, Job, JobCounts, JobPolicy, JobState, QueueDefinition};

/// Inbound webhook payloads, drained first.
pub const WEBHOOK_PROCESSING: &str = "webhook-processing";
/// Periodic and on-demand integration syncs.
pub const INTEGRATION_SYNC: &str = "integration-sync";
/// Messages queued for delivery through a connector.
pub const OUTBOUND_MESSAGES: &str = "outbound-messages";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("a job with key '{key}' is already pending ({existing_id})")]
    Duplicate { key: String, existing_id: String },

    #[error("dispatcher is closed")]
    Closed,
}
