//! Relay configuration
//!
//! Loads relay tuning from a TOML file. Every field has a default so an
//! absent file or a partial file both yield a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file name
pub const CONFIG_FILE: &str = "relay.toml";

/// Prefix the echo handler puts in front of every reply
pub const DEFAULT_ECHO_PREFIX: &str = "Server response: ";

/// Lower bound for the derived reaper tick
const MIN_REAP_INTERVAL_MS: u64 = 1000;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Relay tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Connections silent for longer than this are closed by the reaper
    pub idle_timeout_ms: u64,
    /// Capacity of each connection's outbound queue
    pub max_outbound_queue_per_connection: usize,
    /// Upper bound on a single handler invocation
    pub handler_timeout_ms: u64,
    /// Messages buffered while a connection is still handshaking
    pub max_premature_messages: usize,
    /// Largest accepted inbound payload in bytes (unbounded when unset)
    pub max_payload_bytes: Option<usize>,
    /// Reaper tick; derived from the idle timeout when unset
    pub reap_interval_ms: Option<u64>,
    /// How long shutdown waits for connections to drain
    pub shutdown_grace_ms: u64,
    /// Prefix used by the echo handler
    pub echo_prefix: String,
    /// Close connections whose outbound queue is full instead of dropping
    /// the undeliverable message
    pub disconnect_slow_consumers: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            max_outbound_queue_per_connection: 32,
            handler_timeout_ms: 5_000,
            max_premature_messages: 16,
            max_payload_bytes: None,
            reap_interval_ms: None,
            shutdown_grace_ms: 5_000,
            echo_prefix: DEFAULT_ECHO_PREFIX.to_string(),
            disconnect_slow_consumers: false,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the relay unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_outbound_queue_per_connection == 0 {
            return Err(ConfigError::Invalid(
                "max_outbound_queue_per_connection must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "idle_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.handler_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "handler_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.reap_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "reap_interval_ms must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Override the idle timeout
    pub fn with_idle_timeout_ms(mut self, idle_timeout_ms: Option<u64>) -> Self {
        if let Some(ms) = idle_timeout_ms {
            self.idle_timeout_ms = ms;
        }
        self
    }

    /// Override the outbound queue capacity
    pub fn with_max_outbound_queue(mut self, max: Option<usize>) -> Self {
        if let Some(max) = max {
            self.max_outbound_queue_per_connection = max;
        }
        self
    }

    /// Override the handler timeout
    pub fn with_handler_timeout_ms(mut self, handler_timeout_ms: Option<u64>) -> Self {
        if let Some(ms) = handler_timeout_ms {
            self.handler_timeout_ms = ms;
        }
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Reaper tick: the configured value, or a quarter of the idle timeout
    pub fn reap_interval(&self) -> Duration {
        let ms = self
            .reap_interval_ms
            .unwrap_or_else(|| (self.idle_timeout_ms / 4).max(MIN_REAP_INTERVAL_MS));
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_outbound_queue_per_connection, 32);
        assert_eq!(config.handler_timeout(), Duration::from_secs(5));
        assert_eq!(config.echo_prefix, "Server response: ");
        assert!(config.max_payload_bytes.is_none());
        assert!(!config.disconnect_slow_consumers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let dir = tempdir().unwrap();
        let config = RelayConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            "idle_timeout_ms = 1000\nmax_payload_bytes = 4096\necho_prefix = \"echo: \"\n",
        )
        .unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.idle_timeout_ms, 1000);
        assert_eq!(config.max_payload_bytes, Some(4096));
        assert_eq!(config.echo_prefix, "echo: ");
        // Untouched fields keep their defaults
        assert_eq!(config.max_outbound_queue_per_connection, 32);
        assert_eq!(config.handler_timeout_ms, 5000);
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "idle_timeout_ms = [[[").unwrap();

        let result = RelayConfig::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_rejects_zero_queue() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "max_outbound_queue_per_connection = 0\n").unwrap();

        let result = RelayConfig::load(&path);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let config = RelayConfig {
            handler_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            idle_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            reap_interval_ms: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let config = RelayConfig::default()
            .with_idle_timeout_ms(Some(500))
            .with_max_outbound_queue(Some(4))
            .with_handler_timeout_ms(None);

        assert_eq!(config.idle_timeout_ms, 500);
        assert_eq!(config.max_outbound_queue_per_connection, 4);
        assert_eq!(config.handler_timeout_ms, 5000);
    }

    #[test]
    fn test_reap_interval_derivation() {
        let config = RelayConfig::default();
        assert_eq!(config.reap_interval(), Duration::from_millis(7500));

        // Short idle timeouts are clamped to the minimum tick
        let config = RelayConfig::default().with_idle_timeout_ms(Some(200));
        assert_eq!(config.reap_interval(), Duration::from_millis(1000));

        let config = RelayConfig {
            reap_interval_ms: Some(50),
            ..Default::default()
        };
        assert_eq!(config.reap_interval(), Duration::from_millis(50));
    }
}
