//! Scheduler configuration
//!
//! ```toml
//! queue_capacity = 100
//! record_transaction_history = true
//! history_age_limit_minutes = 1440
//! permanently_recorded_init_period_minutes = 60
//! max_history_records = 0
//! verify_mode = false
//!
//! [default_retry]
//! period_ms = 1000
//! max_count = 3
//! exp_backoff = true
//! ```

use reconcile_api::RetryPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors from configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Capacity of the transaction queue
    pub queue_capacity: usize,
    /// Keep records of processed transactions
    pub record_transaction_history: bool,
    /// Records older than this are trimmed
    pub history_age_limit_minutes: u64,
    /// Transactions started within this period after creation are never trimmed
    pub permanently_recorded_init_period_minutes: u64,
    /// Maximum number of records kept (0 = unlimited)
    pub max_history_records: usize,
    /// Refresh values after every transaction and report discrepancies
    pub verify_mode: bool,
    /// Retry policy used when a commit enables retry without parameters
    pub default_retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            record_transaction_history: true,
            history_age_limit_minutes: 24 * 60,
            permanently_recorded_init_period_minutes: 60,
            max_history_records: 0,
            verify_mode: false,
            default_retry: RetryPolicy::DEFAULT,
        }
    }
}

impl SchedulerConfig {
    /// Small queue, fast retries and verification on
    pub fn testing() -> Self {
        Self {
            queue_capacity: 10,
            verify_mode: true,
            default_retry: RetryPolicy::DEFAULT.with_period(Duration::from_millis(10)),
            ..Self::default()
        }
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: SchedulerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".into()));
        }
        if self.default_retry.period_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_retry.period_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn history_age_limit(&self) -> Duration {
        Duration::from_secs(self.history_age_limit_minutes * 60)
    }

    pub fn permanently_recorded_init_period(&self) -> Duration {
        Duration::from_secs(self.permanently_recorded_init_period_minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.history_age_limit(), Duration::from_secs(86400));
        assert_eq!(config.default_retry, RetryPolicy::DEFAULT);
        assert!(!config.verify_mode);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = SchedulerConfig::from_toml_str(
            r#"
            queue_capacity = 5
            verify_mode = true

            [default_retry]
            max_count = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.queue_capacity, 5);
        assert!(config.verify_mode);
        assert!(config.record_transaction_history);
        assert_eq!(config.default_retry.max_count, 7);
        assert_eq!(config.default_retry.period_ms, 1000);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            SchedulerConfig::from_toml_str("queue_capacity = \"many\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            SchedulerConfig::from_toml_str("queue_capacity = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SchedulerConfig::from_file("/nonexistent/reconcile.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
