use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Per-queue configuration. Loaded from the `[[queues]]` tables of the
/// broker config and immutable once a consumer is running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub visibility_timeout_ms: u64,
    pub max_batch_size: usize,
    pub max_batch_wait_ms: u64,
    /// Hard cap on concurrent invocations. `None` means auto-scale up to
    /// `consumer.max_concurrency`.
    pub concurrency_limit: Option<usize>,
    pub retry: RetryPolicy,
}

impl QueueConfig {
    /// Default visibility timeout: 30 seconds.
    pub const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 30_000;
    pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;
    pub const DEFAULT_MAX_BATCH_WAIT_MS: u64 = 5_000;

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_dead_letter_queue(mut self, dlq: impl Into<String>) -> Self {
        self.retry.dead_letter_queue = Some(dlq.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("queue name must not be empty".into()));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid(format!(
                "queue {}: max_batch_size must be at least 1",
                self.name
            )));
        }
        if self.visibility_timeout_ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "queue {}: visibility_timeout_ms must be positive",
                self.name
            )));
        }
        if self.concurrency_limit == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "queue {}: concurrency_limit must be at least 1",
                self.name
            )));
        }
        if self.retry.dead_letter_queue.as_deref() == Some(self.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "queue {}: dead_letter_queue cannot be the queue itself",
                self.name
            )));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "queue {}: retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.name, self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            visibility_timeout_ms: Self::DEFAULT_VISIBILITY_TIMEOUT_MS,
            max_batch_size: Self::DEFAULT_MAX_BATCH_SIZE,
            max_batch_wait_ms: Self::DEFAULT_MAX_BATCH_WAIT_MS,
            concurrency_limit: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Retry and dead-letter policy for one queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Deliveries allowed before a failing message is dead-lettered.
    /// 0 makes the first failure terminal.
    pub max_attempts: u32,
    /// Exhausted messages are discarded when unset.
    pub dead_letter_queue: Option<String>,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            dead_letter_queue: None,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    /// Number of deliveries a message may receive. With `max_attempts = 0`
    /// the first delivery still happens; only its failure is terminal.
    pub fn allowed_deliveries(&self) -> u32 {
        self.max_attempts.max(1)
    }
}
