//! Service configuration from environment variables.

use std::time::Duration;

use db::{DbConfig, StoreConfig};
use scheduler::SchedulerConfig;

/// Invalid environment configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a whole number of milliseconds, got {value:?}")]
    InvalidMillis { name: &'static str, value: String },

    #[error("{0} is set without {1}")]
    IncompleteCredentials(&'static str, &'static str),
}

/// Everything needed to start the service.
#[derive(Debug, Clone, Default)]
pub struct PusherConfig {
    pub db: DbConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
}

impl PusherConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                          | Default   |
    /// |----------------------------------|-----------|
    /// | `JOB_PUSHER_DB`                  | `mem://`  |
    /// | `JOB_PUSHER_NAMESPACE`           | `jobpusher` |
    /// | `JOB_PUSHER_DATABASE`            | `main`    |
    /// | `JOB_PUSHER_DB_USER`             | --        |
    /// | `JOB_PUSHER_DB_PASSWORD`         | --        |
    /// | `JOB_PUSHER_MIN_RETRY_DELAY_MS`  | `5000`    |
    /// | `JOB_PUSHER_MIN_TIMEOUT_MS`      | `5000`    |
    /// | `JOB_PUSHER_RETENTION_MS`        | `10000`   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(endpoint) = lookup("JOB_PUSHER_DB") {
            config.db = config.db.with_endpoint(endpoint);
        }
        if let Some(namespace) = lookup("JOB_PUSHER_NAMESPACE") {
            config.db = config.db.with_namespace(namespace);
        }
        if let Some(database) = lookup("JOB_PUSHER_DATABASE") {
            config.db = config.db.with_database(database);
        }

        match (lookup("JOB_PUSHER_DB_USER"), lookup("JOB_PUSHER_DB_PASSWORD")) {
            (Some(user), Some(password)) => {
                config.db = config.db.with_credentials(user, password);
            }
            (Some(_), None) => {
                return Err(ConfigError::IncompleteCredentials(
                    "JOB_PUSHER_DB_USER",
                    "JOB_PUSHER_DB_PASSWORD",
                ));
            }
            (None, Some(_)) => {
                return Err(ConfigError::IncompleteCredentials(
                    "JOB_PUSHER_DB_PASSWORD",
                    "JOB_PUSHER_DB_USER",
                ));
            }
            (None, None) => {}
        }

        if let Some(delay) = millis(&lookup, "JOB_PUSHER_MIN_RETRY_DELAY_MS")? {
            config.store.min_retry_delay = delay;
        }
        if let Some(timeout) = millis(&lookup, "JOB_PUSHER_MIN_TIMEOUT_MS")? {
            config.scheduler.min_timeout = timeout;
        }
        if let Some(retention) = millis(&lookup, "JOB_PUSHER_RETENTION_MS")? {
            config.scheduler.retention = retention;
        }

        Ok(config)
    }
}

fn millis<F>(lookup: &F, name: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(name) else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|_| ConfigError::InvalidMillis { name, value })
}
