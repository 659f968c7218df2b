//! Job repository for CRUD operations.

use chrono::{DateTime, Utc};
use pusher_core::{Job, JobId, JobStatus, Priority, QueueEntry, Worker, base64_bytes};
use serde::{Deserialize, Serialize};

use crate::{Database, DbError};

/// Repository for job persistence operations.
#[derive(Clone)]
pub struct JobRepository {
    db: Database,
}

/// Stored form of a job. The record id is the ULID; `job_id` carries it as a
/// plain field so rows deserialize without touching record ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    job_id: JobId,
    topic: String,
    #[serde(with = "base64_bytes")]
    payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_type: Option<String>,
    priority: Priority,
    status: JobStatus,
    #[serde(default)]
    retried: u32,
    #[serde(default)]
    no_retry: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    worker: Option<Worker>,
    #[serde(default, with = "base64_bytes")]
    output: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_encoding: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    expire: Option<DateTime<Utc>>,
}

impl From<Job> for JobRecord {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            topic: job.topic,
            payload: job.payload,
            payload_type: job.payload_type,
            priority: job.priority,
            status: job.status,
            retried: job.retried,
            no_retry: job.no_retry,
            created_at: job.created_at,
            worker: job.worker,
            output: job.output,
            content_type: job.content_type,
            content_encoding: job.content_encoding,
            expire: job.expire,
        }
    }
}

impl From<JobRecord> for Job {
    fn from(record: JobRecord) -> Self {
        Self {
            id: record.job_id,
            topic: record.topic,
            payload: record.payload,
            payload_type: record.payload_type,
            priority: record.priority,
            status: record.status,
            retried: record.retried,
            no_retry: record.no_retry,
            created_at: record.created_at,
            worker: record.worker,
            output: record.output,
            content_type: record.content_type,
            content_encoding: record.content_encoding,
            expire: record.expire,
        }
    }
}

/// Filter options for listing jobs. Empty lists match everything.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub topic: Option<String>,
    pub priorities: Vec<Priority>,
    pub statuses: Vec<JobStatus>,
}

impl JobFilter {
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priorities.push(priority);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }
}

/// One page of jobs, newest first.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Zero-based page index.
    pub page: usize,
    pub page_size: usize,
    /// Jobs matching the filter across all pages.
    pub total: u64,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

impl JobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a job and its queue entry in one transaction.
    pub async fn create_with_entry(&self, job: &Job, entry: &QueueEntry) -> Result<(), DbError> {
        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                CREATE type::thing('job', $id) CONTENT $job RETURN NONE;
                CREATE type::thing('queue_entry', $id) CONTENT $entry RETURN NONE;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("id", job.id.to_string()))
            .bind(("job", JobRecord::from(job.clone())))
            .bind(("entry", entry.clone()))
            .await?
            .check()?;
        Ok(())
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Option<Job>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM type::thing('job', $id)")
            .bind(("id", id.to_string()))
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;
        Ok(records.into_iter().next().map(Job::from))
    }

    /// Overwrite a stored job. Returns false if it no longer exists.
    pub async fn replace(&self, job: &Job) -> Result<bool, DbError> {
        let mut result = self
            .db
            .query("UPDATE type::thing('job', $id) CONTENT $job RETURN AFTER")
            .bind(("id", job.id.to_string()))
            .bind(("job", JobRecord::from(job.clone())))
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;
        Ok(!records.is_empty())
    }

    /// Delete a job and its queue entry together.
    pub async fn delete_with_entry(&self, id: JobId) -> Result<(), DbError> {
        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                DELETE type::thing('job', $id);
                DELETE type::thing('queue_entry', $id);
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("id", id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// List jobs matching a filter, newest first.
    pub async fn list(
        &self,
        filter: &JobFilter,
        page: usize,
        page_size: usize,
    ) -> Result<JobPage, DbError> {
        let mut conditions = Vec::new();

        if filter.topic.is_some() {
            conditions.push("topic = $topic");
        }
        if !filter.priorities.is_empty() {
            conditions.push("priority IN $priorities");
        }
        if !filter.statuses.is_empty() {
            conditions.push("status IN $statuses");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let page_size = page_size.max(1);
        let query = format!(
            "SELECT * FROM job {where_clause} ORDER BY created_at DESC, job_id DESC LIMIT {} START {}; \
             SELECT count() FROM job {where_clause} GROUP ALL;",
            page_size,
            page * page_size
        );

        let priorities: Vec<u8> = filter.priorities.iter().map(|p| p.as_u8()).collect();
        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let mut response = self
            .db
            .query(query)
            .bind(("topic", filter.topic.clone().unwrap_or_default()))
            .bind(("priorities", priorities))
            .bind(("statuses", statuses))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        let counts: Vec<CountRow> = response.take(1)?;

        Ok(JobPage {
            jobs: records.into_iter().map(Job::from).collect(),
            page,
            page_size,
            total: counts.first().map(|c| c.count).unwrap_or(0),
        })
    }

    /// Delete terminal jobs whose expiry has passed. Returns how many were removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                DELETE job
                WHERE status IN ['success', 'failure'] AND expire != NONE AND expire <= $now
                RETURN BEFORE
                "#,
            )
            .bind(("now", now.timestamp_millis()))
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;
        Ok(records.len())
    }

    /// Reset every running job to pending. Returns how many were reset.
    pub async fn reset_running(&self) -> Result<usize, DbError> {
        let mut result = self
            .db
            .query("UPDATE job SET status = 'pending' WHERE status = 'running' RETURN AFTER")
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;
        Ok(records.len())
    }
}
