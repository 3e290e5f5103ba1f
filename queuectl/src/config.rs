//! Configuration for the queue and its worker pool.

use std::time::Duration;

/// Tunables shared by the store, worker pool, and submission surface.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Retry ceiling applied when a submission does not specify one.
    pub default_max_retries: u32,
    /// Base of the exponential retry backoff, in whole seconds. Minimum 1.
    pub backoff_base: u32,
    /// How long an idle worker loop sleeps before polling again.
    pub poll_interval: Duration,
    /// Age after which a held lease is considered abandoned and eligible
    /// for reclaim. Must comfortably exceed `command_timeout`, otherwise
    /// a slow-but-alive execution could be handed to a second worker.
    pub lock_timeout: Duration,
    /// Hard cap on a single command execution.
    pub command_timeout: Duration,
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// Whether the pool runs the periodic stale-lease reclaim loop.
    pub reclaim_stale: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            backoff_base: 2,
            poll_interval: Duration::from_millis(2000),
            lock_timeout: Duration::from_millis(60_000),
            command_timeout: Duration::from_millis(30_000),
            workers: 1,
            reclaim_stale: true,
        }
    }
}

impl QueueConfig {
    /// Create a new builder with default values.
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }
}

/// Builder for [`QueueConfig`].
#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    /// Set the default retry ceiling for submissions.
    pub fn default_max_retries(mut self, retries: u32) -> Self {
        self.config.default_max_retries = retries;
        self
    }

    /// Set the backoff base in seconds. Values below 1 are clamped to 1.
    pub fn backoff_base(mut self, base: u32) -> Self {
        self.config.backoff_base = base.max(1);
        self
    }

    /// Set the idle poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the lease age after which a processing job may be reclaimed.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Set the per-execution command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    /// Set the number of worker loops. Values below 1 are clamped to 1.
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers.max(1);
        self
    }

    /// Enable or disable the stale-lease reclaim loop.
    pub fn reclaim_stale(mut self, enabled: bool) -> Self {
        self.config.reclaim_stale = enabled;
        self
    }

    /// Build the config.
    pub fn build(self) -> QueueConfig {
        self.config
    }
}
