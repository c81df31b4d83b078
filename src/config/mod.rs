//! Configuration management
//!
//! Handles loading and validation of configuration from TOML files. Every
//! field has a serde default, so an empty file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub mod types;

pub use types::{DispatcherConfig, LoggingConfig};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Dispatcher configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Create default configuration
    pub fn default_config() -> Result<Self> {
        let config = Config {
            dispatcher: DispatcherConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let dispatcher = &self.dispatcher;

        if dispatcher.max_events_per_second == 0 {
            anyhow::bail!("max_events_per_second must be greater than zero");
        }

        if dispatcher.key_repeat_delay_ms == 0 {
            anyhow::bail!("key_repeat_delay_ms must be greater than zero");
        }

        if dispatcher.default_dispatching_timeout_ms == 0 {
            anyhow::bail!("default_dispatching_timeout_ms must be greater than zero");
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}", self.logging.level),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default_config().unwrap();
        assert_eq!(config.dispatcher.max_events_per_second, 60);
        assert_eq!(config.dispatcher.default_dispatching_timeout_ms, 5000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_validation_zero_rate() {
        let mut config = Config::default_config().unwrap();
        config.dispatcher.max_events_per_second = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_level() {
        let mut config = Config::default_config().unwrap();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dispatcher]\nkey_repeat_timeout_ms = 400\n\n[logging]\nlevel = \"debug\"").unwrap();
        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.dispatcher.key_repeat_timeout_ms, 400);
        assert_eq!(config.dispatcher.key_repeat_delay_ms, 50);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dispatcher]\nkey_repeat_delay_ms = 0").unwrap();
        assert!(Config::load(file.path().to_str().unwrap()).is_err());
        assert!(Config::load("/nonexistent/dispatcher.toml").is_err());
    }
}
