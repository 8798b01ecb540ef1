//! Configuration center settings.
//!
//! Settings are plain serde structs so they can be loaded from a JSON file,
//! embedded in a larger application config, or built in code. Connection
//! URL parameters override individual fields (see `ConnectUrl::apply_to`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading settings or parsing a connect URL.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the settings file.
    #[error("Read error: {0}")]
    ReadError(#[from] std::io::Error),

    /// Settings are not valid JSON for the expected shape.
    #[error("Invalid data: {0}")]
    InvalidData(#[from] serde_json::Error),

    /// The connect URL could not be parsed.
    #[error("Invalid connect URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A parameter has a value of the wrong type.
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Settings for one connected center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MconfSettings {
    /// Let `add_conf` replace an existing entry instead of failing.
    pub allow_overwrite: bool,

    /// How long `connect` waits for the backing store to become ready.
    pub connect_timeout_ms: u64,

    /// Queued notifications per subscriber. Zero (the default) means
    /// unbounded; a subscriber that falls further behind than a configured
    /// bound skips ahead and is resynchronized from a fresh snapshot.
    pub subscriber_queue_capacity: usize,

    /// Number of background errors kept for inspection.
    pub error_history: usize,

    /// Apply changes made by other centers sharing the backing store.
    pub follow_remote: bool,

    /// Persistence retry policy.
    pub retry: RetrySettings,
}

impl Default for MconfSettings {
    fn default() -> Self {
        Self {
            allow_overwrite: false,
            connect_timeout_ms: 5_000,
            subscriber_queue_capacity: 0,
            error_history: 128,
            follow_remote: true,
            retry: RetrySettings::default(),
        }
    }
}

impl MconfSettings {
    /// Parse settings from a JSON document. Missing fields use defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Exponential backoff policy for backing-store writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    /// Total attempts per operation, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_backoff_ms: u64,

    /// Upper bound for a single delay.
    pub max_backoff_ms: u64,

    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    /// Delay before retry number `retry` (1-based), capped at the maximum.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let settings = MconfSettings::default();
        assert!(!settings.allow_overwrite);
        assert_eq!(settings.connect_timeout(), Duration::from_secs(5));
        assert_eq!(settings.retry.max_attempts, 5);
    }

    #[test]
    fn test_partial_json() {
        let settings = MconfSettings::from_json_str(
            r#"{"allowOverwrite": true, "retry": {"maxAttempts": 2}}"#,
        )
        .unwrap();

        assert!(settings.allow_overwrite);
        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.retry.initial_backoff_ms, 50);
        assert_eq!(settings.subscriber_queue_capacity, 0);
    }

    #[test]
    fn test_invalid_json() {
        let err = MconfSettings::from_json_str(r#"{"allowOverwrite": "yes"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidData(_)));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetrySettings {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
        };

        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(5), Duration::from_millis(1_000));
        assert_eq!(retry.backoff(50), Duration::from_millis(1_000));
    }
}
