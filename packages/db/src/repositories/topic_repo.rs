//! Topic repository: the worker registry.

use pusher_core::Topic;

use crate::{Database, DbError};

/// Repository for topic persistence operations.
#[derive(Clone)]
pub struct TopicRepository {
    db: Database,
}

impl TopicRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create or replace a topic. The caller validates first.
    pub async fn save(&self, topic: &Topic) -> Result<(), DbError> {
        self.db
            .query("UPSERT type::thing('topic', $name) CONTENT $topic RETURN NONE")
            .bind(("name", topic.name.clone()))
            .bind(("topic", topic.clone()))
            .await?
            .check()?;
        Ok(())
    }

    /// Get a topic by name.
    pub async fn get(&self, name: &str) -> Result<Option<Topic>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM type::thing('topic', $name)")
            .bind(("name", name.to_string()))
            .await?;

        let topics: Vec<Topic> = result.take(0)?;
        Ok(topics.into_iter().next())
    }

    /// List all topics ordered by name.
    pub async fn list(&self) -> Result<Vec<Topic>, DbError> {
        let mut result = self.db.query("SELECT * FROM topic ORDER BY name ASC").await?;
        let topics: Vec<Topic> = result.take(0)?;
        Ok(topics)
    }

    /// Delete a topic. Returns whether it existed.
    pub async fn delete(&self, name: &str) -> Result<bool, DbError> {
        let mut result = self
            .db
            .query("DELETE type::thing('topic', $name) RETURN BEFORE")
            .bind(("name", name.to_string()))
            .await?;

        let deleted: Vec<Topic> = result.take(0)?;
        Ok(!deleted.is_empty())
    }
}
