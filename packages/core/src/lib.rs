//! Core domain types for the job pusher.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobStatus and Priority for work items
//! - Topic and Worker for the per-topic worker registry
//! - PartitionKey, QueueEntry and Counter for per-partition ordering
//! - Events for change notifications

mod events;
mod job;
mod partition;
mod topic;

pub use events::{SchedulerEvent, StoreEvent};
pub use job::{
    InvalidPayloadType, InvalidPriority, Job, JobId, JobStatus, Priority, base64_bytes,
    validate_payload_type,
};
pub use partition::{Counter, PartitionKey, QueueEntry};
pub use topic::{RetryPolicy, Topic, TopicError, Worker};
