//! Dispatch scheduler for the job pusher.
//!
//! The scheduler is a single Ractor actor that owns all in-memory dispatch
//! state: the topic mirror, per-worker load, live jobs and their output
//! buffers. Store notifications are forwarded into its mailbox, so passes
//! never overlap and bursts of notifications coalesce into one extra pass.
//!
//! # Usage
//!
//! ```ignore
//! use scheduler::{SchedulerConfig, start_scheduler};
//!
//! let (scheduler, handle) = start_scheduler(store.clone(), SchedulerConfig::default()).await?;
//! let stream = scheduler.output_stream(job_id).await?;
//! scheduler.shutdown()?;
//! handle.await?;
//! ```

mod config;
mod dispatch;
mod messages;
mod output;
mod scheduler;

use std::time::Duration;

use db::JobStore;
use pusher_core::{JobId, SchedulerEvent};
use ractor::Actor;
use ractor::rpc::CallResult;
use tokio::sync::broadcast;

pub use config::SchedulerConfig;
pub use dispatch::{
    ASSUME_HEADERS, DispatchError, RETRIED_HEADER, RETRY_LIMIT_HEADER, Tail, classify,
};
pub use messages::{SchedulerError, SchedulerMessage, WorkerActivity};
pub use output::{OutputBuffer, OutputEvent, OutputHead, OutputStream};
pub use scheduler::{Scheduler, SchedulerArgs, SchedulerState, SlotKey};

/// Re-export ractor types for convenience.
pub use ractor::{ActorRef, RpcReplyPort};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 256;

/// Client side of a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    actor: ActorRef<SchedulerMessage>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    /// Subscribe to working-changed notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Attach to a job's output. `None` once the job is neither live nor
    /// within its retention window; read the stored job instead.
    pub async fn output_stream(
        &self,
        job_id: JobId,
    ) -> Result<Option<OutputStream>, SchedulerError> {
        self.call(|reply| SchedulerMessage::OutputStream { job_id, reply }).await
    }

    /// Per-worker load snapshot.
    pub async fn working(&self) -> Result<Vec<WorkerActivity>, SchedulerError> {
        self.call(|reply| SchedulerMessage::Working { reply }).await
    }

    /// Cancel a live job's outbound call; it completes as a non-retryable
    /// failure. Returns false if the job is not in flight.
    pub async fn abort(&self, job_id: JobId) -> Result<bool, SchedulerError> {
        self.call(|reply| SchedulerMessage::Abort { job_id, reply }).await
    }

    /// Stop the scheduler. In-flight jobs are left running in the store and
    /// recovered on the next start.
    pub fn shutdown(&self) -> Result<(), SchedulerError> {
        self.actor
            .send_message(SchedulerMessage::Shutdown)
            .map_err(|_| SchedulerError::Stopped)
    }

    async fn call<T, F>(&self, msg: F) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<T>) -> SchedulerMessage,
    {
        match ractor::rpc::call(&self.actor, msg, Some(CALL_TIMEOUT)).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(SchedulerError::Timeout),
            Ok(CallResult::SenderError) | Err(_) => Err(SchedulerError::Stopped),
        }
    }
}

/// Start the scheduler for `store`.
///
/// The actor is unnamed, so any number of schedulers can run side by side.
pub async fn start_scheduler(
    store: JobStore,
    config: SchedulerConfig,
) -> Result<(SchedulerHandle, tokio::task::JoinHandle<()>), SchedulerError> {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let args = SchedulerArgs {
        store,
        config,
        events: events.clone(),
    };

    let (actor, handle) = Actor::spawn(None, Scheduler, args).await?;

    Ok((SchedulerHandle { actor, events }, handle))
}
