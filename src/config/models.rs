use crate::humanize::{ByteSize, HumanDuration};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker connection and broker-server settings
///
/// `url` and `queue` are shared by master and workers; the remaining fields
/// only matter to the `broker` process.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: ByteSize,
    /// Consumers silent for longer than this are reaped and their deliveries requeued
    #[serde(default = "default_consumer_timeout")]
    pub consumer_timeout: HumanDuration,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: HumanDuration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            queue: default_queue(),
            bind_addr: default_bind_addr(),
            data_path: default_data_path(),
            max_message_bytes: default_max_message_bytes(),
            consumer_timeout: default_consumer_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_broker_url() -> String {
    "http://localhost:5680".to_string()
}

fn default_queue() -> String {
    "tasks".to_string()
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5680))
}

fn default_data_path() -> PathBuf {
    PathBuf::from("data/queue")
}

fn default_max_message_bytes() -> ByteSize {
    ByteSize(64 * 1024)
}

fn default_consumer_timeout() -> HumanDuration {
    HumanDuration::from_secs(120)
}

fn default_connect_timeout() -> HumanDuration {
    HumanDuration::from_secs(5)
}

/// Where the master gets its partitions from
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DiscoverySource {
    /// TOML or JSON file with a `partitions` table
    File { path: PathBuf },
    /// Scrape a top-sites index (country list, then one listing per country)
    TopSites {
        #[serde(default = "default_top_sites_url")]
        base_url: String,
    },
}

impl Default for DiscoverySource {
    fn default() -> Self {
        DiscoverySource::TopSites {
            base_url: default_top_sites_url(),
        }
    }
}

fn default_top_sites_url() -> String {
    "https://www.alexa.com/topsites/".to_string()
}

/// Master (distributor) settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MasterConfig {
    /// Parent directory of the per-partition output directories
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    #[serde(default)]
    pub discovery: DiscoverySource,
    #[serde(default = "default_discovery_attempts")]
    pub discovery_attempts: u32,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            discovery: DiscoverySource::default(),
            discovery_attempts: default_discovery_attempts(),
        }
    }
}

fn default_output_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_discovery_attempts() -> u32 {
    5
}

/// Worker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Long-poll window for a single delivery request
    #[serde(default = "default_poll_wait")]
    pub poll_wait: HumanDuration,
    #[serde(default)]
    pub fetch: FetchConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_wait: default_poll_wait(),
            fetch: FetchConfig::default(),
        }
    }
}

fn default_poll_wait() -> HumanDuration {
    HumanDuration::from_secs(30)
}

/// Page download settings, fixed for every attempt
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout")]
    pub timeout: HumanDuration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: default_fetch_timeout(),
            user_agent: default_user_agent(),
            max_redirects: default_max_redirects(),
        }
    }
}

fn default_fetch_timeout() -> HumanDuration {
    HumanDuration::from_secs(5)
}

fn default_user_agent() -> String {
    "Mozilla/5.0".to_string()
}

fn default_max_redirects() -> usize {
    10
}

/// Log thresholds: `base_level` for dependencies, `crate_level` for spiderq itself
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_base_level")]
    pub base_level: String,
    #[serde(default = "default_crate_level")]
    pub crate_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            base_level: default_base_level(),
            crate_level: default_crate_level(),
        }
    }
}

fn default_base_level() -> String {
    "error".to_string()
}

fn default_crate_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.broker.queue, "tasks");
        assert_eq!(config.broker.url, "http://localhost:5680");
        assert_eq!(config.worker.poll_wait.as_duration(), Duration::from_secs(30));
        assert_eq!(config.worker.fetch.timeout.as_duration(), Duration::from_secs(5));
        assert_eq!(config.worker.fetch.user_agent, "Mozilla/5.0");
        assert_eq!(config.master.discovery_attempts, 5);
    }

    #[test]
    fn test_discovery_source_tagging() {
        let source: DiscoverySource =
            toml::from_str("source = \"file\"\npath = \"sites.toml\"").unwrap();
        assert_eq!(
            source,
            DiscoverySource::File {
                path: PathBuf::from("sites.toml")
            }
        );

        let source: DiscoverySource = toml::from_str("source = \"top_sites\"").unwrap();
        assert!(matches!(source, DiscoverySource::TopSites { .. }));
    }
}
