//! Message types for the scheduler actor.

use pusher_core::JobId;
use ractor::RpcReplyPort;

use crate::output::OutputStream;

/// Messages for the Scheduler actor.
pub enum SchedulerMessage {
    /// Run one reconciliation pass over idle worker capacity.
    Reconcile,

    /// Reload the topic mirror from the store, then reconcile.
    ReloadTopics,

    /// A dispatch task completed.
    JobFinished {
        job_id: JobId,
        success: bool,
        /// Completion must not be retried (aborted by an operator).
        no_retry: bool,
    },

    /// Cancel an in-flight call. Replies whether the job was live.
    Abort {
        job_id: JobId,
        reply: RpcReplyPort<bool>,
    },

    /// Cancel every live job the store holds an abort request for.
    SyncAborts,

    /// Attach to a live or recently finished job's output.
    OutputStream {
        job_id: JobId,
        reply: RpcReplyPort<Option<OutputStream>>,
    },

    /// Snapshot of per-worker activity.
    Working {
        reply: RpcReplyPort<Vec<WorkerActivity>>,
    },

    /// Drop a finished job's retained output, unless a later completion
    /// replaced it.
    ForgetFinished { job_id: JobId, generation: u64 },

    /// Periodic tick for housekeeping.
    Tick,

    /// Stop the scheduler. In-flight calls are abandoned.
    Shutdown,
}

/// Load of one worker of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerActivity {
    pub topic: String,
    pub url: String,
    pub concurrency: u32,
    pub active: u32,
    pub jobs: Vec<JobId>,
}

/// Error type for scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Failed to start scheduler: {0}")]
    Spawn(#[from] ractor::SpawnErr),

    #[error("Scheduler is not running")]
    Stopped,

    #[error("Timeout")]
    Timeout,
}
