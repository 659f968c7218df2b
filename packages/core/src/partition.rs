//! Partition types: the orderable projection of active jobs.

use serde::{Deserialize, Serialize};

use crate::{JobId, Priority};

/// The (topic, priority) pair jobs are ordered within.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub topic: String,
    pub priority: Priority,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, priority: Priority) -> Self {
        Self {
            topic: topic.into(),
            priority,
        }
    }

    /// All three partitions of a topic in claim order.
    pub fn all_for(topic: &str) -> [PartitionKey; 3] {
        Priority::ALL.map(|priority| PartitionKey::new(topic, priority))
    }

    /// Parse the `topic#priority` form. The priority is taken after the last `#`.
    pub fn parse(key: &str) -> Option<Self> {
        let (topic, priority) = key.rsplit_once('#')?;
        let priority = Priority::try_from(priority.parse::<u8>().ok()?).ok()?;
        Some(Self::new(topic, priority))
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.topic, self.priority)
    }
}

/// One active (pending or running) job's place in its partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    /// `topic#priority`.
    pub partition: String,
    pub topic: String,
    pub priority: Priority,
    pub seq: u64,
    /// Claimed by a dispatch attempt (or waiting out a retry backoff).
    pub working: bool,
}

/// Per-partition sequence bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Counter {
    /// `topic#priority`.
    pub partition: String,
    pub topic: String,
    pub priority: Priority,
    /// Last sequence handed out.
    pub pending: u64,
    /// Sequence most recently claimed.
    pub running: u64,
    /// Highest completed sequence.
    pub done: u64,
}

impl Counter {
    /// Sequences allocated but not yet completed, an upper bound on the backlog.
    pub fn outstanding(&self) -> u64 {
        self.pending.saturating_sub(self.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_key_round_trips_through_display() {
        let key = PartitionKey::new("build#nightly", Priority::Low);
        assert_eq!(key.to_string(), "build#nightly#2");
        assert_eq!(PartitionKey::parse("build#nightly#2"), Some(key));
        assert_eq!(PartitionKey::parse("build#7"), None);
        assert_eq!(PartitionKey::parse("build"), None);
    }

    #[test]
    fn partitions_are_listed_in_claim_order() {
        let keys = PartitionKey::all_for("build");
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["build#0", "build#1", "build#2"]);
    }
}
