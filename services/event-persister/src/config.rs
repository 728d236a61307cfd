//! Service configuration
//!
//! A single `PersisterConfig` value is built once at process start (from a
//! TOML file or in code) and passed by reference into every runner. Nothing
//! in the pipeline reads configuration from the environment on its own.
//!
//! Durations are written in milliseconds in the file and exposed as
//! `Duration` through accessor methods.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::events::StreamKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersisterConfig {
    pub broker: BrokerConfig,
    pub storage: StorageConfig,
    pub sink: SinkConfig,
    pub runner: RunnerConfig,
}

/// Stream broker endpoints and subscription.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub brokers: Vec<String>,
    pub group_id: String,
    pub orders_topic: String,
    pub matches_topic: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            group_id: "event-persister".to_string(),
            orders_topic: "orders".to_string(),
            matches_topic: "matches".to_string(),
        }
    }
}

/// Time-series store connection parameters.
///
/// Consumed by the external storage client; the pipeline itself only
/// validates them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub host: String,
    /// HTTP / line-protocol ingestion port
    pub http_port: u16,
    /// Postgres wire port
    pub pg_port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub pool_size: usize,
    pub orders_table: String,
    pub matches_table: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            http_port: 9000,
            pg_port: 8812,
            username: "admin".to_string(),
            password: "quest".to_string(),
            database: "qdb".to_string(),
            pool_size: 4,
            orders_table: "orders".to_string(),
            matches_table: "matches".to_string(),
        }
    }
}

/// Batching and retry limits for the sink writer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Flush once this many events are buffered.
    pub max_batch_size: usize,
    /// Flush once the oldest buffered event is this old.
    pub max_batch_age_ms: u64,
    /// Write attempts per flush before the batch is reported as failed.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound on a single write attempt.
    pub attempt_timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            max_batch_age_ms: 1_000,
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            attempt_timeout_ms: 10_000,
        }
    }
}

impl SinkConfig {
    pub fn max_batch_age(&self) -> Duration {
        Duration::from_millis(self.max_batch_age_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Poll loop timings and failure budgets.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// How long one poll waits for records.
    pub poll_timeout_ms: u64,
    /// Bound on the final flush when the loop is cancelled.
    pub drain_timeout_ms: u64,
    /// Pause between flush rounds while the sink is unavailable.
    pub recovery_interval_ms: u64,
    /// Failed flush rounds tolerated before the runner gives up.
    pub max_recovery_rounds: u32,
    /// Consecutive poll failures tolerated before the runner gives up.
    pub max_poll_failures: u32,
    pub poll_backoff_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            drain_timeout_ms: 10_000,
            recovery_interval_ms: 1_000,
            max_recovery_rounds: 10,
            max_poll_failures: 10,
            poll_backoff_ms: 500,
        }
    }
}

impl RunnerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn poll_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_backoff_ms)
    }
}

impl PersisterConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn topic_for(&self, stream: StreamKind) -> &str {
        match stream {
            StreamKind::Orders => &self.broker.orders_topic,
            StreamKind::Matches => &self.broker.matches_topic,
        }
    }

    pub fn table_for(&self, stream: StreamKind) -> &str {
        match stream {
            StreamKind::Orders => &self.storage.orders_table,
            StreamKind::Matches => &self.storage.matches_table,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if self.broker.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(invalid("broker.brokers", "at least one endpoint is required"));
        }
        if self.broker.group_id.trim().is_empty() {
            return Err(invalid("broker.group_id", "must not be empty"));
        }
        if self.broker.orders_topic.trim().is_empty() {
            return Err(invalid("broker.orders_topic", "must not be empty"));
        }
        if self.broker.matches_topic.trim().is_empty() {
            return Err(invalid("broker.matches_topic", "must not be empty"));
        }
        if self.storage.host.trim().is_empty() {
            return Err(invalid("storage.host", "must not be empty"));
        }
        if self.storage.pool_size == 0 {
            return Err(invalid("storage.pool_size", "must be at least 1"));
        }
        if self.sink.max_batch_size == 0 {
            return Err(invalid("sink.max_batch_size", "must be at least 1"));
        }
        if self.sink.max_attempts == 0 {
            return Err(invalid("sink.max_attempts", "must be at least 1"));
        }
        if self.sink.initial_backoff_ms > self.sink.max_backoff_ms {
            return Err(invalid(
                "sink.initial_backoff_ms",
                "must not exceed sink.max_backoff_ms",
            ));
        }
        if self.sink.attempt_timeout_ms == 0 {
            return Err(invalid("sink.attempt_timeout_ms", "must be positive"));
        }
        if self.runner.poll_timeout_ms == 0 {
            return Err(invalid("runner.poll_timeout_ms", "must be positive"));
        }
        if self.runner.drain_timeout_ms == 0 {
            return Err(invalid("runner.drain_timeout_ms", "must be positive"));
        }
        if self.runner.recovery_interval_ms == 0 {
            return Err(invalid("runner.recovery_interval_ms", "must be positive"));
        }
        if self.runner.poll_backoff_ms == 0 {
            return Err(invalid("runner.poll_backoff_ms", "must be positive"));
        }
        if self.runner.max_recovery_rounds == 0 {
            return Err(invalid("runner.max_recovery_rounds", "must be at least 1"));
        }
        if self.runner.max_poll_failures == 0 {
            return Err(invalid("runner.max_poll_failures", "must be at least 1"));
        }
        Ok(())
    }
}
