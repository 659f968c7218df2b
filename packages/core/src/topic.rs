//! Topic domain types: a named queue with its worker pool and retry policy.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of retries for a new topic.
pub const DEFAULT_RETRIES: u32 = 5;
/// Default retry backoff for a new topic (milliseconds).
pub const DEFAULT_BACKOFF_MS: u64 = 5_000;
/// Default dispatch timeout for a new topic (milliseconds).
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// An HTTP endpoint that executes job payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Worker {
    pub url: String,
    /// Maximum number of jobs in flight on this worker at once.
    pub concurrency: u32,
}

impl Worker {
    pub fn new(url: impl Into<String>, concurrency: u32) -> Self {
        Self {
            url: url.into(),
            concurrency,
        }
    }
}

/// Invalid topic configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic name must not be empty")]
    EmptyName,
    #[error("worker url must not be empty")]
    EmptyWorkerUrl,
    #[error("worker url {0} is listed more than once")]
    DuplicateWorker(String),
}

/// Retry settings a finished job is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub retries: u32,
    /// Minimum delay before a failed job becomes eligible again.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
        }
    }
}

/// A topic owns an ordered list of workers and the policy applied to its jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    /// Topic name, also its identity.
    pub name: String,
    #[serde(default)]
    pub workers: Vec<Worker>,
    pub retries: u32,
    pub backoff_ms: u64,
    pub timeout_ms: u64,
}

impl Topic {
    /// Create a topic with no workers and the default policy.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workers: Vec::new(),
            retries: DEFAULT_RETRIES,
            backoff_ms: DEFAULT_BACKOFF_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Append a worker endpoint.
    pub fn with_worker(mut self, url: impl Into<String>, concurrency: u32) -> Self {
        self.workers.push(Worker::new(url, concurrency));
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check the name and that worker URLs are present and unique.
    pub fn validate(&self) -> Result<(), TopicError> {
        if self.name.trim().is_empty() {
            return Err(TopicError::EmptyName);
        }
        let mut seen = HashSet::new();
        for worker in &self.workers {
            let url = worker.url.trim();
            if url.is_empty() {
                return Err(TopicError::EmptyWorkerUrl);
            }
            if !seen.insert(url) {
                return Err(TopicError::DuplicateWorker(url.to_string()));
            }
        }
        Ok(())
    }
}
