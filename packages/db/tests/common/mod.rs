#![allow(dead_code)]

use std::time::{Duration, Instant};

use db::{Database, DbConfig, DbError, JobStore, StoreConfig};
use pusher_core::Job;

/// A fresh in-memory database. Every call is an independent datastore.
pub async fn memory_db() -> Result<Database, DbError> {
    db::connect(&DbConfig::memory()).await
}

pub async fn open_store(config: StoreConfig) -> Result<(Database, JobStore), DbError> {
    let db = memory_db().await?;
    let store = JobStore::open(db.clone(), config).await?;
    Ok((db, store))
}

/// Store config with a short retry floor so retry cycles run quickly.
pub fn fast_config() -> StoreConfig {
    StoreConfig {
        min_retry_delay: Duration::from_millis(20),
        ..StoreConfig::default()
    }
}

/// Poll `next_job` until it yields a job or `timeout` passes.
pub async fn claim_within(
    store: &JobStore,
    topic: &str,
    timeout: Duration,
) -> Result<Option<Job>, DbError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(job) = store.next_job(topic).await? {
            return Ok(Some(job));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
