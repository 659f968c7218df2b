use std::time::Duration;

/// Scheduler timing and buffering settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Floor for the per-dispatch timeout; a topic's timeout below it is raised.
    pub min_timeout: Duration,
    /// How long a finished job's output stays readable for late subscribers.
    pub retention: Duration,
    /// Trailing response bytes kept for success classification.
    pub tail_bytes: usize,
    /// Interval of the housekeeping tick (TTL purge and a safety reconcile).
    pub housekeeping_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_timeout: Duration::from_secs(5),
            retention: Duration::from_secs(10),
            tail_bytes: 50,
            housekeeping_interval: Duration::from_secs(30),
        }
    }
}
