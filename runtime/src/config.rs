//! Runtime configuration.
//!
//! [`RuntimeConfig`] follows the builder style used throughout the runtime:
//! start from [`RuntimeConfig::default`] and override with `with_*` methods,
//! or load overrides from the environment with [`RuntimeConfig::from_env`].
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `FLOWBUS_HISTORY_CAPACITY` | `history_capacity` | 1000 |
//! | `FLOWBUS_MESSAGE_LOG_CAPACITY` | `message_log_capacity` | 1000 |
//! | `FLOWBUS_MAX_REARMS` | `rearm_policy` | unlimited |
//!
//! # Example
//!
//! ```
//! use flowbus_runtime::config::{RearmPolicy, RuntimeConfig};
//!
//! let config = RuntimeConfig::default()
//!     .with_history_capacity(250)
//!     .with_rearm_policy(RearmPolicy::MaxRearms(3));
//!
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default bound on the event history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Default bound on the command/event message log.
pub const DEFAULT_MESSAGE_LOG_CAPACITY: usize = 1000;

/// Environment variable overriding `history_capacity`.
pub const ENV_HISTORY_CAPACITY: &str = "FLOWBUS_HISTORY_CAPACITY";

/// Environment variable overriding `message_log_capacity`.
pub const ENV_MESSAGE_LOG_CAPACITY: &str = "FLOWBUS_MESSAGE_LOG_CAPACITY";

/// Environment variable setting a re-arm cap for persisted joins.
pub const ENV_MAX_REARMS: &str = "FLOWBUS_MAX_REARMS";

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was set but could not be parsed.
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue {
        /// Variable name
        key: String,
        /// Raw value
        value: String,
    },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// How often a join instance may re-arm after its handler requests `persist`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", content = "limit", rename_all = "snake_case")]
pub enum RearmPolicy {
    /// Re-arm every time `persist` is requested.
    #[default]
    Unlimited,

    /// Re-arm at most this many times; a further `persist` request cleans
    /// the instance up instead.
    MaxRearms(u32),
}

impl RearmPolicy {
    /// Whether an instance that has already re-armed `rearm_count` times may
    /// re-arm again.
    #[must_use]
    pub const fn allows(self, rearm_count: u32) -> bool {
        match self {
            Self::Unlimited => true,
            Self::MaxRearms(limit) => rearm_count < limit,
        }
    }
}

/// Configuration for the orchestration runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum number of events kept in history; oldest are evicted first.
    pub history_capacity: usize,

    /// Maximum number of commands and events kept in the message log.
    pub message_log_capacity: usize,

    /// Re-arm policy for persisted join instances.
    pub rearm_policy: RearmPolicy,

    /// Poll interval used by `Orchestrator::wait_idle`.
    pub idle_poll_interval: Duration,
}

impl RuntimeConfig {
    /// Create a configuration with explicit values.
    #[must_use]
    pub const fn new(
        history_capacity: usize,
        message_log_capacity: usize,
        rearm_policy: RearmPolicy,
    ) -> Self {
        Self {
            history_capacity,
            message_log_capacity,
            rearm_policy,
            idle_poll_interval: Duration::from_millis(10),
        }
    }

    /// Set the history capacity.
    #[must_use]
    pub const fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Set the message log capacity.
    #[must_use]
    pub const fn with_message_log_capacity(mut self, capacity: usize) -> Self {
        self.message_log_capacity = capacity;
        self
    }

    /// Set the join re-arm policy.
    #[must_use]
    pub const fn with_rearm_policy(mut self, policy: RearmPolicy) -> Self {
        self.rearm_policy = policy;
        self
    }

    /// Set the idle poll interval.
    #[must_use]
    pub const fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    /// Load defaults overridden by `FLOWBUS_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable cannot be parsed or the result
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load defaults overridden by values from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a value cannot be parsed or the result
    /// fails validation.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(capacity) = parse_var::<usize>(&lookup, ENV_HISTORY_CAPACITY)? {
            config.history_capacity = capacity;
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, ENV_MESSAGE_LOG_CAPACITY)? {
            config.message_log_capacity = capacity;
        }
        if let Some(limit) = parse_var::<u32>(&lookup, ENV_MAX_REARMS)? {
            config.rearm_policy = RearmPolicy::MaxRearms(limit);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if a capacity is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::Validation(
                "history_capacity must be > 0".to_string(),
            ));
        }
        if self.message_log_capacity == 0 {
            return Err(ConfigError::Validation(
                "message_log_capacity must be > 0".to_string(),
            ));
        }
        if self.idle_poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "idle_poll_interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new(
            DEFAULT_HISTORY_CAPACITY,
            DEFAULT_MESSAGE_LOG_CAPACITY,
            RearmPolicy::Unlimited,
        )
    }
}

fn parse_var<T>(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
            })
        })
        .transpose()
}
