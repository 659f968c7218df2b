//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// Every statement is idempotent, so this runs on each open.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(TOPIC_SCHEMA).await?.check()?;
    db.query(JOB_SCHEMA).await?.check()?;
    db.query(QUEUE_ENTRY_SCHEMA).await?.check()?;
    db.query(COUNTER_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Topic table: record id is the topic name.
const TOPIC_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS topic SCHEMALESS;

DEFINE INDEX IF NOT EXISTS topic_name ON topic FIELDS name UNIQUE;
"#;

/// Job table: record id is the job ULID, mirrored in `job_id`.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

DEFINE INDEX IF NOT EXISTS job_id ON job FIELDS job_id UNIQUE;
DEFINE INDEX IF NOT EXISTS job_topic ON job FIELDS topic;
DEFINE INDEX IF NOT EXISTS job_status ON job FIELDS status;
DEFINE INDEX IF NOT EXISTS job_created ON job FIELDS created_at;
DEFINE INDEX IF NOT EXISTS job_expire ON job FIELDS expire;
"#;

/// Queue entries: one per pending or running job, keyed by the job ULID.
const QUEUE_ENTRY_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS queue_entry SCHEMALESS;

DEFINE INDEX IF NOT EXISTS queue_entry_topic ON queue_entry FIELDS topic;
-- Claim scan: lowest unclaimed sequence of a partition
DEFINE INDEX IF NOT EXISTS queue_entry_claim ON queue_entry FIELDS partition, working, seq;
"#;

/// Per-partition counters, keyed by `topic#priority`.
const COUNTER_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS counter SCHEMALESS;

DEFINE INDEX IF NOT EXISTS counter_topic ON counter FIELDS topic;
"#;
