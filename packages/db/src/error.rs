use pusher_core::{InvalidPayloadType, InvalidPriority, TopicError};
use thiserror::Error;

/// Database and store errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error(transparent)]
    InvalidPriority(#[from] InvalidPriority),
    #[error(transparent)]
    InvalidPayloadType(#[from] InvalidPayloadType),
    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),
}

impl DbError {
    /// Caller errors that must never be retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DbError::InvalidPriority(_) | DbError::InvalidPayloadType(_) | DbError::InvalidTopic(_)
        )
    }
}
