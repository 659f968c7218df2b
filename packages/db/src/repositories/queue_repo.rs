//! Queue entry repository: the orderable projection of active jobs.

use pusher_core::{JobId, PartitionKey, QueueEntry};
use serde::Deserialize;

use crate::{Database, DbError};

/// Repository for queue entries.
#[derive(Clone)]
pub struct QueueRepository {
    db: Database,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

impl QueueRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get the entry of a job, if it is active.
    pub async fn get(&self, job_id: JobId) -> Result<Option<QueueEntry>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM type::thing('queue_entry', $id)")
            .bind(("id", job_id.to_string()))
            .await?;

        let entries: Vec<QueueEntry> = result.take(0)?;
        Ok(entries.into_iter().next())
    }

    /// Lowest-sequence unclaimed entry of a partition.
    pub async fn first_unclaimed(
        &self,
        partition: &PartitionKey,
    ) -> Result<Option<QueueEntry>, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                SELECT * FROM queue_entry
                WHERE partition = $partition AND working = false
                ORDER BY seq ASC
                LIMIT 1
                "#,
            )
            .bind(("partition", partition.to_string()))
            .await?;

        let entries: Vec<QueueEntry> = result.take(0)?;
        Ok(entries.into_iter().next())
    }

    /// Flip an entry to working, only if it is still unclaimed.
    ///
    /// Returns `None` when another caller claimed it first.
    pub async fn claim(&self, job_id: JobId) -> Result<Option<QueueEntry>, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                UPDATE type::thing('queue_entry', $id)
                SET working = true
                WHERE working = false
                RETURN AFTER
                "#,
            )
            .bind(("id", job_id.to_string()))
            .await?;

        let entries: Vec<QueueEntry> = result.take(0)?;
        Ok(entries.into_iter().next())
    }

    /// Move an entry to a fresh sequence and make it claimable again.
    pub async fn requeue(&self, job_id: JobId, seq: u64) -> Result<Option<QueueEntry>, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                UPDATE type::thing('queue_entry', $id)
                SET seq = $seq, working = false
                RETURN AFTER
                "#,
            )
            .bind(("id", job_id.to_string()))
            .bind(("seq", seq))
            .await?;

        let entries: Vec<QueueEntry> = result.take(0)?;
        Ok(entries.into_iter().next())
    }

    /// Remove a job's entry. Returns the removed entry, if any.
    pub async fn delete(&self, job_id: JobId) -> Result<Option<QueueEntry>, DbError> {
        let mut result = self
            .db
            .query("DELETE type::thing('queue_entry', $id) RETURN BEFORE")
            .bind(("id", job_id.to_string()))
            .await?;

        let entries: Vec<QueueEntry> = result.take(0)?;
        Ok(entries.into_iter().next())
    }

    /// Active entries of a topic, by priority then sequence.
    pub async fn list_for_topic(&self, topic: &str) -> Result<Vec<QueueEntry>, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                SELECT * FROM queue_entry
                WHERE topic = $topic
                ORDER BY priority ASC, seq ASC
                "#,
            )
            .bind(("topic", topic.to_string()))
            .await?;

        let entries: Vec<QueueEntry> = result.take(0)?;
        Ok(entries)
    }

    /// Number of active entries of a topic across its partitions.
    pub async fn count_for_topic(&self, topic: &str) -> Result<u64, DbError> {
        let mut result = self
            .db
            .query("SELECT count() FROM queue_entry WHERE topic = $topic GROUP ALL")
            .bind(("topic", topic.to_string()))
            .await?;

        let rows: Vec<CountRow> = result.take(0)?;
        Ok(rows.first().map(|r| r.count).unwrap_or(0))
    }

    /// Unclaimed entries ahead of `seq` in a partition.
    pub async fn count_ahead(&self, partition: &PartitionKey, seq: u64) -> Result<u64, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                SELECT count() FROM queue_entry
                WHERE partition = $partition AND working = false AND seq < $seq
                GROUP ALL
                "#,
            )
            .bind(("partition", partition.to_string()))
            .bind(("seq", seq))
            .await?;

        let rows: Vec<CountRow> = result.take(0)?;
        Ok(rows.first().map(|r| r.count).unwrap_or(0))
    }

    /// Release every claimed entry. Returns the released entries.
    pub async fn release_all(&self) -> Result<Vec<QueueEntry>, DbError> {
        let mut result = self
            .db
            .query("UPDATE queue_entry SET working = false WHERE working = true RETURN AFTER")
            .await?;

        let entries: Vec<QueueEntry> = result.take(0)?;
        Ok(entries)
    }
}
