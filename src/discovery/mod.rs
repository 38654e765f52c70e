//! Sources of partitions and their URLs
//!
//! A [`Discovery`] produces the full work list for one distribution run. Two
//! sources ship with the crate:
//!
//! - [`StaticDiscovery`]: a TOML or JSON file listing partitions
//! - [`TopSitesScraper`]: scrapes a top-sites index, one partition per country
//!
//! Network sources fail with [`DiscoveryError::Transient`]; callers wrap them
//! in [`with_retries`].

mod static_file;
mod top_sites;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::config::{DiscoverySource, MasterConfig};

pub use static_file::StaticDiscovery;
pub use top_sites::TopSitesScraper;

/// A grouping key and the URLs that belong to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub key: String,
    pub urls: Vec<String>,
}

impl Partition {
    pub fn new(key: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            key: key.into(),
            urls,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Transient discovery failure: {0}")]
    Transient(String),

    #[error("Discovery failed: {0}")]
    Fatal(String),

    #[error("Discovery failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl DiscoveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DiscoveryError::Transient(_))
    }
}

#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<Partition>, DiscoveryError>;
}

/// Bounded retry for transient discovery failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Pause before attempt `n` is `backoff * (n - 1)`
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            backoff: Duration::from_secs(1),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Run `op` until it succeeds, fails fatally, or `policy.attempts` is spent
///
/// Only [`DiscoveryError::Transient`] is retried. A zero attempt budget still
/// runs `op` once.
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, DiscoveryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DiscoveryError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match op().await {
            Ok(value) => return Ok(value),
            Err(DiscoveryError::Transient(message)) => {
                if attempt >= attempts {
                    return Err(DiscoveryError::RetriesExhausted {
                        attempts,
                        last: message,
                    });
                }
                warn!(attempt, attempts, error = %message, "Discovery failed, retrying");
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Build the configured discovery source
pub fn from_config(config: &MasterConfig) -> Result<Box<dyn Discovery>, DiscoveryError> {
    Ok(match &config.discovery {
        DiscoverySource::File { path } => Box::new(StaticDiscovery::new(path.clone())),
        DiscoverySource::TopSites { base_url } => Box::new(TopSitesScraper::new(base_url)?),
    })
}
