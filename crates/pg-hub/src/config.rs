//! Hub configuration.
//!
//! Configuration is loaded from environment variables with defaults suitable
//! for a PostgreSQL server with stock settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// PostgreSQL rejects NOTIFY payloads of 8000 bytes or more.
pub const MAX_NOTIFY_PAYLOAD_BYTES: usize = 7999;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Error message.
        message: String,
    },
}

/// Hub configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Hub name, attached to every log record.
    pub name: String,

    /// Delay before retrying a failed connection attempt, in milliseconds.
    pub reconnect_delay_ms: u64,

    /// Largest payload `notify` accepts, in bytes.
    pub max_payload_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: "pg_hub".to_string(),
            reconnect_delay_ms: 5000,
            max_payload_bytes: MAX_NOTIFY_PAYLOAD_BYTES,
        }
    }
}

impl HubConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PG_HUB_NAME`: Hub name (default: pg_hub)
    /// - `PG_HUB_RECONNECT_MS`: Reconnect delay in milliseconds (default: 5000)
    /// - `PG_HUB_MAX_PAYLOAD_BYTES`: Payload size cap (default: 7999)
    ///
    /// Unparsable values fall back to their defaults.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            name: std::env::var("PG_HUB_NAME").unwrap_or(default.name),
            reconnect_delay_ms: std::env::var("PG_HUB_RECONNECT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default.reconnect_delay_ms),
            max_payload_bytes: std::env::var("PG_HUB_MAX_PAYLOAD_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default.max_payload_bytes),
        }
    }

    /// Load configuration from environment variables, rejecting unparsable values.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        let default = Self::default();

        Ok(Self {
            name: std::env::var("PG_HUB_NAME").unwrap_or(default.name),
            reconnect_delay_ms: parse_env("PG_HUB_RECONNECT_MS")?.unwrap_or(default.reconnect_delay_ms),
            max_payload_bytes: parse_env("PG_HUB_MAX_PAYLOAD_BYTES")?.unwrap_or(default.max_payload_bytes),
        }
        .validate()?)
    }

    /// Set the hub name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the payload size cap.
    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    /// Get the reconnect delay as a Duration.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Check that the configuration can carry at least an empty event.
    pub fn validate(self) -> Result<Self, ConfigError> {
        // Smallest payload the codec produces is "e:null".
        if self.max_payload_bytes < 6 {
            return Err(ConfigError::InvalidValue {
                key: "max_payload_bytes".to_string(),
                message: format!("{} is too small to hold an event", self.max_payload_bytes),
            });
        }
        Ok(self)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}
