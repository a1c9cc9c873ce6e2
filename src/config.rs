//! Arbitration configuration using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `DAQ_ARBITER_` (`__` separates nesting levels)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! DAQ_ARBITER_LOG_LEVEL=debug
//! DAQ_ARBITER_QUEUE__CAPACITY=16
//! DAQ_ARBITER_QUEUE__SUBMIT_TIMEOUT_MS=250
//! DAQ_ARBITER_POLLING__INTERVAL_MS=50
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_arbiter::config::ArbiterConfig;
//! use std::path::Path;
//!
//! let config = ArbiterConfig::load(Some(Path::new("arbiter.toml")))?;
//! println!("Queue capacity: {}", config.queue.capacity);
//! # Ok::<(), daq_arbiter::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::queue::SubmitMode;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DAQ_ARBITER_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not load or deserialize a source
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are semantically invalid
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Logging level directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Admission queue settings
    #[serde(default)]
    pub queue: QueueConfig,
    /// Polling defaults for hardware state changes
    #[serde(default)]
    pub polling: PollingConfig,
}

/// Admission queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of pending tickets (0 = unbounded)
    #[serde(default)]
    pub capacity: usize,
    /// How long a guaranteed call may wait for a free slot.
    ///
    /// Unset waits indefinitely; 0 rejects immediately.
    #[serde(default)]
    pub submit_timeout_ms: Option<u64>,
}

/// Defaults for polling loops between gated calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Pause between polling attempts in milliseconds
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    /// Attempts before a polling loop gives up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> u64 {
    100
}

fn default_max_attempts() -> usize {
    10
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            queue: QueueConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            submit_timeout_ms: None,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl QueueConfig {
    /// Submit mode applied to guaranteed calls.
    pub fn submit_mode(&self) -> SubmitMode {
        match self.submit_timeout_ms {
            None => SubmitMode::Blocking,
            Some(0) => SubmitMode::NonBlocking,
            Some(ms) => SubmitMode::Timeout(Duration::from_millis(ms)),
        }
    }
}

impl PollingConfig {
    /// Pause between attempts.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl ArbiterConfig {
    /// Figment with defaults, the optional TOML file, and env overrides.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(ArbiterConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate configuration.
    ///
    /// A missing file is not an error: Figment skips absent TOML files, so
    /// defaults and environment overrides still apply.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(path))
    }

    /// Extract and validate from an arbitrary figment.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: ArbiterConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints that parsing cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "polling.max_attempts must be at least 1".to_string(),
            ));
        }
        if matches!(self.queue.submit_timeout_ms, Some(ms) if ms > 0) && self.queue.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue.submit_timeout_ms has no effect on an unbounded queue; set queue.capacity"
                    .to_string(),
            ));
        }
        EnvFilter::try_new(&self.log_level).map_err(|e| {
            ConfigError::ValidationError(format!("invalid log_level '{}': {}", self.log_level, e))
        })?;
        Ok(())
    }
}
