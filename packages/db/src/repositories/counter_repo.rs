//! Counter repository: per-partition sequence allocation.

use pusher_core::{Counter, PartitionKey};

use crate::{Database, DbError};

/// Repository for per-partition counters.
#[derive(Clone)]
pub struct CounterRepository {
    db: Database,
}

impl CounterRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Increment the partition's `pending` counter and return the new value.
    ///
    /// The counter is created at 1 when absent. Read and write happen in one
    /// statement, so concurrent callers never observe the same value.
    pub async fn allocate(&self, partition: &PartitionKey) -> Result<u64, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                UPSERT type::thing('counter', $key)
                SET pending += 1, partition = $key, topic = $topic, priority = $priority
                RETURN AFTER
                "#,
            )
            .bind(("key", partition.to_string()))
            .bind(("topic", partition.topic.clone()))
            .bind(("priority", partition.priority.as_u8()))
            .await?;

        let counters: Vec<Counter> = result.take(0)?;

        counters
            .into_iter()
            .next()
            .map(|c| c.pending)
            .filter(|seq| *seq > 0)
            .ok_or_else(|| DbError::Query(format!("Failed to allocate sequence for {}", partition)))
    }

    /// Record the sequence most recently claimed.
    pub async fn mark_running(&self, partition: &PartitionKey, seq: u64) -> Result<(), DbError> {
        self.db
            .query("UPDATE type::thing('counter', $key) SET running = $seq RETURN NONE")
            .bind(("key", partition.to_string()))
            .bind(("seq", seq))
            .await?
            .check()?;
        Ok(())
    }

    /// Raise `done` to `seq`. Lower values are ignored, so `done` never decreases.
    pub async fn advance_done(&self, partition: &PartitionKey, seq: u64) -> Result<(), DbError> {
        self.db
            .query(
                r#"
                UPDATE type::thing('counter', $key)
                SET done = $seq
                WHERE done = NONE OR done < $seq
                RETURN NONE
                "#,
            )
            .bind(("key", partition.to_string()))
            .bind(("seq", seq))
            .await?
            .check()?;
        Ok(())
    }

    /// Get a partition's counter.
    pub async fn get(&self, partition: &PartitionKey) -> Result<Option<Counter>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM type::thing('counter', $key)")
            .bind(("key", partition.to_string()))
            .await?;

        let counters: Vec<Counter> = result.take(0)?;
        Ok(counters.into_iter().next())
    }

    /// List every counter, including those of removed topics.
    pub async fn list(&self) -> Result<Vec<Counter>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM counter ORDER BY topic ASC, priority ASC")
            .await?;

        let counters: Vec<Counter> = result.take(0)?;
        Ok(counters)
    }
}
