use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::broker::controller::DEFAULT_MAX_CONCURRENCY;
use crate::error::ConfigError;
use crate::queue::QueueConfig;

/// Top-level broker configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub queues: Vec<QueueConfig>,
}

/// Producer-side limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub max_body_bytes: usize,
    pub max_delay_ms: u64,
    /// Most items accepted by one `send_batch` call.
    pub max_batch_items: usize,
}

/// Consumer runtime settings shared by every queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// How often the batcher re-polls the store while filling a batch.
    pub poll_interval_ms: u64,
    /// Wall-clock budget of one invocation.
    pub invocation_timeout_ms: u64,
    /// Auto-scaling ceiling for queues without a `concurrency_limit`.
    pub max_concurrency: usize,
    pub scale_down_after_empty_polls: u32,
    /// How often the supervisor reconciles its worker count with the target.
    pub supervisor_tick_ms: u64,
    /// Pause after a failed lease before polling again.
    pub fetch_error_backoff_ms: u64,
    pub report_channel_capacity: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 128 * 1024,
            max_delay_ms: 12 * 60 * 60 * 1_000,
            max_batch_items: 100,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            invocation_timeout_ms: 30_000,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            scale_down_after_empty_polls: 3,
            supervisor_tick_ms: 50,
            fetch_error_backoff_ms: 200,
            report_channel_capacity: 1024,
        }
    }
}

impl ConsumerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    pub fn supervisor_tick(&self) -> Duration {
        Duration::from_millis(self.supervisor_tick_ms.max(1))
    }

    pub fn fetch_error_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_error_backoff_ms)
    }
}

impl FerryConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: FerryConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.producer.max_batch_items == 0 {
            return Err(ConfigError::Invalid(
                "producer.max_batch_items must be at least 1".into(),
            ));
        }
        if self.consumer.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "consumer.max_concurrency must be at least 1".into(),
            ));
        }
        if self.consumer.invocation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "consumer.invocation_timeout_ms must be positive".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for queue in &self.queues {
            queue.validate()?;
            if !seen.insert(queue.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "queue {} configured more than once",
                    queue.name
                )));
            }
        }
        Ok(())
    }

    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }
}
