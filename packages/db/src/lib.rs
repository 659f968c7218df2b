//! SurrealDB persistence for the job pusher.
//!
//! This crate provides database connectivity, repositories for topics, jobs,
//! queue entries and partition counters, and the [`JobStore`] that combines
//! them into the operations producers and the scheduler use.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod error;
mod schema;
mod store;
pub mod repositories;

pub use connection::{Database, DbConfig, connect};
pub use error::DbError;
pub use repositories::{JobFilter, JobPage};
pub use schema::init_schema;
pub use store::{DoneOutcome, JobDetail, JobStore, StoreConfig};
