//! Job domain types for work items pushed to workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::topic::Worker;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A priority outside of the three supported classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("priority must be 0, 1 or 2, got {0}")]
pub struct InvalidPriority(pub u8);

/// A payload type that cannot travel as a `content-type` header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("payload type {0:?} is not a valid header value")]
pub struct InvalidPayloadType(pub String);

/// Reject payload types with control characters other than tab.
pub fn validate_payload_type(value: &str) -> Result<(), InvalidPayloadType> {
    if value.bytes().any(|b| (b < b' ' && b != b'\t') || b == 0x7f) {
        return Err(InvalidPayloadType(value.to_string()));
    }
    Ok(())
}

/// Priority class of a job. Lower values are served first, strictly.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    High = 0,
    #[default]
    Normal = 1,
    Low = 2,
}

impl Priority {
    /// All priorities in claim order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = InvalidPriority;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::High),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::Low),
            other => Err(InvalidPriority(other)),
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.as_u8()
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Current status of a job in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker slot, or waiting out a retry backoff.
    #[default]
    Pending,
    /// Claimed and dispatched to a worker.
    Running,
    /// Terminal: the worker reported success.
    Success,
    /// Terminal: retries exhausted, non-retryable, or aborted.
    Failure,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }

    /// Get a simple status string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job represents one opaque payload to be POSTed to a worker of its topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Topic the job was submitted to.
    pub topic: String,
    /// Opaque request body sent to the worker.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// MIME type of the payload, forwarded as the request content type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<String>,
    pub priority: Priority,
    pub status: JobStatus,
    /// Number of retries already scheduled for this job.
    #[serde(default)]
    pub retried: u32,
    /// Submitted as non-retryable: the first failure is terminal.
    #[serde(default)]
    pub no_retry: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Worker the job was last assigned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<Worker>,
    /// Output captured from the last attempt.
    #[serde(default, with = "base64_bytes")]
    pub output: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    /// When a terminal record becomes eligible for purging.
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expire: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: JobId::new(),
            topic: topic.into(),
            payload: payload.into(),
            payload_type: None,
            priority: Priority::default(),
            status: JobStatus::Pending,
            retried: 0,
            no_retry: false,
            created_at: Utc::now(),
            worker: None,
            output: Vec::new(),
            content_type: None,
            content_encoding: None,
            expire: None,
        }
    }

    /// Set the priority for this job.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the declared payload content type.
    pub fn with_payload_type(mut self, payload_type: Option<String>) -> Self {
        self.payload_type = payload_type;
        self
    }

    /// Mark the job as non-retryable.
    pub fn with_no_retry(mut self, no_retry: bool) -> Self {
        self.no_retry = no_retry;
        self
    }

    /// The (topic, priority) partition this job is ordered in.
    pub fn partition(&self) -> crate::PartitionKey {
        crate::PartitionKey::new(self.topic.clone(), self.priority)
    }
}

/// Serde adapter storing binary blobs as standard base64 strings.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_accepts_only_three_classes() {
        assert_eq!(Priority::try_from(0), Ok(Priority::High));
        assert_eq!(Priority::try_from(2), Ok(Priority::Low));
        assert_eq!(Priority::try_from(3), Err(InvalidPriority(3)));
        assert!(Priority::High < Priority::Low);
    }

    #[test]
    fn job_serializes_binary_fields_as_base64() {
        let job = Job::new("build", vec![0u8, 159, 146, 150]).with_priority(Priority::Low);
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["payload"], "AJ+Slg==");
        assert_eq!(value["priority"], 2);
        assert_eq!(value["status"], "pending");

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back.payload, job.payload);
        assert_eq!(back.id, job.id);
    }

    #[test]
    fn payload_types_must_be_header_safe() {
        assert!(validate_payload_type("application/json; charset=utf-8").is_ok());
        assert!(validate_payload_type("text/plain;\tformat=flowed").is_ok());
        assert_eq!(
            validate_payload_type("text/plain\r\nx-injected: 1"),
            Err(InvalidPayloadType("text/plain\r\nx-injected: 1".into()))
        );
        assert!(validate_payload_type("text/\u{7f}").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failure.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
