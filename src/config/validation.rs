use super::models::{Config, DiscoverySource};
use crate::queue::validate_queue_name;
use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid queue name '{name}': {reason}")]
    InvalidQueueName { name: String, reason: String },

    #[error("Broker URL must start with http:// or https://, got '{url}'")]
    InvalidBrokerUrl { url: String },

    #[error("Duration for {field} must be positive")]
    ZeroDuration { field: &'static str },

    #[error("Discovery attempts must be at least 1")]
    ZeroDiscoveryAttempts,

    #[error("User agent must not be empty")]
    EmptyUserAgent,

    #[error("Unknown log level '{value}' for {field}")]
    InvalidLogLevel { field: &'static str, value: String },

    #[error("Top-sites base URL must end with '/', got '{url}'")]
    InvalidTopSitesUrl { url: String },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_broker(config)?;
    validate_master(config)?;
    validate_worker(config)?;
    validate_logging(config)?;
    Ok(())
}

fn validate_broker(config: &Config) -> Result<(), ValidationError> {
    let broker = &config.broker;

    validate_queue_name(&broker.queue).map_err(|e| ValidationError::InvalidQueueName {
        name: broker.queue.clone(),
        reason: e.to_string(),
    })?;

    if !(broker.url.starts_with("http://") || broker.url.starts_with("https://")) {
        return Err(ValidationError::InvalidBrokerUrl {
            url: broker.url.clone(),
        });
    }

    if broker.consumer_timeout.as_duration().is_zero() {
        return Err(ValidationError::ZeroDuration {
            field: "broker.consumer_timeout",
        });
    }

    if broker.connect_timeout.as_duration().is_zero() {
        return Err(ValidationError::ZeroDuration {
            field: "broker.connect_timeout",
        });
    }

    Ok(())
}

fn validate_master(config: &Config) -> Result<(), ValidationError> {
    if config.master.discovery_attempts == 0 {
        return Err(ValidationError::ZeroDiscoveryAttempts);
    }

    // Listing paths are joined onto the base URL
    if let DiscoverySource::TopSites { base_url } = &config.master.discovery {
        if !base_url.ends_with('/') {
            return Err(ValidationError::InvalidTopSitesUrl {
                url: base_url.clone(),
            });
        }
    }

    Ok(())
}

fn validate_worker(config: &Config) -> Result<(), ValidationError> {
    let worker = &config.worker;

    if worker.fetch.timeout.as_duration().is_zero() {
        return Err(ValidationError::ZeroDuration {
            field: "worker.fetch.timeout",
        });
    }

    if worker.fetch.user_agent.trim().is_empty() {
        return Err(ValidationError::EmptyUserAgent);
    }

    Ok(())
}

fn validate_logging(config: &Config) -> Result<(), ValidationError> {
    for (field, value) in [
        ("logging.base_level", &config.logging.base_level),
        ("logging.crate_level", &config.logging.crate_level),
    ] {
        if value.parse::<LevelFilter>().is_err() {
            return Err(ValidationError::InvalidLogLevel {
                field,
                value: value.clone(),
            });
        }
    }

    Ok(())
}
