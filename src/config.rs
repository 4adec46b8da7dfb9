use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Hard per-call limit enforced by the remote batch-insert endpoint.
pub const MAX_REMOTE_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("config parse error: {0}")]
    Parse(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 5_000,
            max_ms: 300_000,
            jitter_ratio: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_ms == 0 {
            return Err(ConfigError::Invalid("backoff.base_ms must be > 0".into()));
        }
        if self.max_ms < self.base_ms {
            return Err(ConfigError::Invalid(
                "backoff.max_ms must be >= backoff.base_ms".into(),
            ));
        }
        if !self.jitter_ratio.is_finite() || !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::Invalid(
                "backoff.jitter_ratio must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum queued items; the oldest are evicted beyond this.
    pub capacity: u64,
    /// Delivery attempts before an item is dropped as a permanent failure.
    pub max_attempts: u32,
    /// Items pulled from the store per flush pass.
    pub fetch_limit: usize,
    pub max_batch_size: usize,
    pub flush_interval_ms: u64,
    pub backoff: BackoffConfig,
    /// Fixed jitter seed; `None` seeds from OS entropy.
    pub jitter_seed: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            max_attempts: 3,
            fetch_limit: 200,
            max_batch_size: 50,
            flush_interval_ms: 30_000,
            backoff: BackoffConfig::default(),
            jitter_seed: None,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("capacity must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be > 0".into()));
        }
        if self.fetch_limit == 0 {
            return Err(ConfigError::Invalid("fetch_limit must be > 0".into()));
        }
        if self.max_batch_size == 0 || self.max_batch_size > MAX_REMOTE_BATCH_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_batch_size must be between 1 and {MAX_REMOTE_BATCH_SIZE}"
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid("flush_interval_ms must be > 0".into()));
        }
        self.backoff.validate()
    }
}
