//! Configuration management for spiderq
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use spiderq::config::Config;
//!
//! let config = Config::load(None).expect("Failed to load configuration");
//! println!("Broker at {} using queue {}", config.broker.url, config.broker.queue);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `SPIDERQ__<section>__<key>`
//!
//! Examples:
//! - `SPIDERQ__BROKER__URL=http://queue.internal:5680`
//! - `SPIDERQ__BROKER__QUEUE=tasks`
//! - `SPIDERQ__WORKER__FETCH__TIMEOUT=5s`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/spiderq.toml`.
//! This can be overridden with `--config` or the `SPIDERQ_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::{ByteSize, HumanDuration};
pub use models::{
    BrokerConfig, Config, DiscoverySource, FetchConfig, LoggingConfig, MasterConfig,
    WorkerConfig,
};
pub use validation::ValidationError;

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`SPIDERQ__*`)
    /// 2. TOML file (`explicit`, else `SPIDERQ_CONFIG`, else `config/spiderq.toml`)
    /// 3. Default values
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = sources::load(explicit)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(&config_path, "[broker]\nqueue = \"pages\"\n").unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.broker.queue, "pages");
        assert_eq!(config.worker.fetch.user_agent, "Mozilla/5.0");
    }

    #[test]
    fn test_validation_runs_after_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(&config_path, "[worker.fetch]\nuser_agent = \"  \"\n").unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::EmptyUserAgent)
        ));
    }

    #[test]
    fn test_malformed_file_is_load_error() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(&config_path, "[worker\nprefetch = ").unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(result.unwrap_err(), ConfigError::LoadError(_)));
    }
}
