use std::time::Duration;

use serde::Deserialize;

use courier_batch::BatchConfig;
use courier_storage_clickhouse::ClickHouseConfig;
use courier_storage_postgres::PostgresConfig;

use crate::broker::BrokerOptions;
use crate::error::EngineError;

/// Root configuration, parsed from TOML. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub expiration: ExpirationSection,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_true")]
    pub replay_backlog: bool,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            replay_backlog: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpirationSection {
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for ExpirationSection {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Which storage backend the broker runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Postgres,
    Clickhouse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Pending operations that wake the flusher early.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Cap on acknowledged-but-unflushed operations.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_pending: default_max_pending(),
            postgres: PostgresConfig::default(),
            clickhouse: ClickHouseConfig::default(),
        }
    }
}

fn default_subscriber_buffer() -> usize {
    200
}
fn default_true() -> bool {
    true
}
fn default_sweep_interval_ms() -> u64 {
    100
}
fn default_batch_size() -> usize {
    100
}
fn default_flush_interval_ms() -> u64 {
    5000
}
fn default_max_pending() -> usize {
    100_000
}

impl StorageConfig {
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            max_pending: self.max_pending,
        }
    }
}

impl CourierConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content).map_err(|e| e.with_context(path))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.broker.subscriber_buffer == 0 {
            return Err(EngineError::Config("broker.subscriber_buffer must be positive".into()));
        }
        if self.expiration.sweep_interval_ms == 0 {
            return Err(EngineError::Config("expiration.sweep_interval_ms must be positive".into()));
        }
        if self.storage.batch_size == 0 || self.storage.flush_interval_ms == 0 {
            return Err(EngineError::Config(
                "storage.batch_size and storage.flush_interval_ms must be positive".into(),
            ));
        }
        if self.storage.max_pending < self.storage.batch_size {
            return Err(EngineError::Config(
                "storage.max_pending must be at least storage.batch_size".into(),
            ));
        }
        Ok(())
    }

    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            subscriber_buffer: self.broker.subscriber_buffer,
            replay_backlog: self.broker.replay_backlog,
            sweep_interval: Duration::from_millis(self.expiration.sweep_interval_ms),
        }
    }
}
