//! Change notifications published by the store and the scheduler.

use crate::{JobId, PartitionKey};

/// Events emitted by the job store after a mutation has been persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A job was enqueued, claimed, completed, or re-queued for retry.
    QueueChanged {
        /// The partition that changed, when a single one did.
        partition: Option<PartitionKey>,
    },
    /// A topic's configuration was saved or removed.
    TopicChanged { topic: String },
    /// An operator asked for a job to be cancelled.
    JobAborted { job_id: JobId },
}

impl StoreEvent {
    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            StoreEvent::QueueChanged {
                partition: Some(partition),
            } => format!("Queue {} changed", partition),
            StoreEvent::QueueChanged { partition: None } => "Queues changed".to_string(),
            StoreEvent::TopicChanged { topic } => format!("Topic {} changed", topic),
            StoreEvent::JobAborted { job_id } => format!("Job {} aborted", job_id),
        }
    }
}

/// Events emitted by the scheduler for live-status consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// The set of in-flight jobs changed. `job_id` is set when one job finished;
    /// `None` means one or more jobs were dispatched.
    WorkingChanged { job_id: Option<JobId> },
}
