//! Job pusher service: wires the durable job store to the dispatch scheduler.
//!
//! Lifecycle is explicit: [`JobPusher::start`] opens the store (running
//! restart recovery) and starts the scheduler; [`JobPusher::shutdown`] stops
//! the scheduler and waits for it. Producers use [`JobPusher::store`] to
//! enqueue and inspect jobs.

mod config;

use db::{DbError, JobStore};
use scheduler::{SchedulerError, SchedulerHandle, start_scheduler};
use tokio::task::JoinHandle;

pub use config::{ConfigError, PusherConfig};

/// Errors while starting or stopping the service.
#[derive(Debug, thiserror::Error)]
pub enum PusherError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Scheduler task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A running job pusher.
pub struct JobPusher {
    store: JobStore,
    scheduler: SchedulerHandle,
    scheduler_task: JoinHandle<()>,
}

impl JobPusher {
    /// Connect to the configured database and start dispatching.
    pub async fn start(config: PusherConfig) -> Result<Self, PusherError> {
        tracing::info!("Starting job pusher...");
        let store = JobStore::connect(&config.db, config.store).await?;
        Self::with_store(store, config.scheduler).await
    }

    /// Start dispatching for an already opened store.
    pub async fn with_store(
        store: JobStore,
        scheduler_config: scheduler::SchedulerConfig,
    ) -> Result<Self, PusherError> {
        let (scheduler, scheduler_task) = start_scheduler(store.clone(), scheduler_config).await?;
        tracing::info!("Job pusher ready");

        Ok(Self {
            store,
            scheduler,
            scheduler_task,
        })
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Stop the scheduler and wait for it to exit. Jobs still in flight stay
    /// claimed in the store and are recovered on the next start.
    pub async fn shutdown(self) -> Result<(), PusherError> {
        tracing::info!("Shutting down job pusher");
        self.scheduler.shutdown()?;
        self.scheduler_task.await?;
        Ok(())
    }
}
