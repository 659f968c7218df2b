//! Repository implementations for database operations.

mod counter_repo;
mod job_repo;
mod queue_repo;
mod topic_repo;

pub use counter_repo::CounterRepository;
pub use job_repo::{JobFilter, JobPage, JobRepository};
pub use queue_repo::QueueRepository;
pub use topic_repo::TopicRepository;
