//! Task distribution
//!
//! One run: check every partition key, declare the queue, purge whatever a
//! previous run left, then for each partition create its output directory and
//! publish one persistent [`Task`] per URL. Directories always exist before
//! their first task is published.

pub mod layout;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::{Config, DiscoverySource};
use crate::discovery::{self, DiscoveryError, Partition, RetryPolicy, with_retries};
use crate::messaging::{BrokerClient, DeliveryMode, MessagingError, TaskQueue};
use crate::observability::Metrics;
use crate::proto::Task;

pub use layout::LayoutError;

#[derive(Debug, Error)]
pub enum DistributeError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Failed to encode task: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DistributeError {
    pub fn is_connection(&self) -> bool {
        matches!(self, DistributeError::Messaging(e) if e.is_connection())
    }
}

/// Totals for one distribution run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DistributionResult {
    pub partitions: usize,
    pub tasks_published: usize,
    /// Messages left over from a previous run
    pub purged: u64,
}

/// Publishes discovered partitions to a [`TaskQueue`]
pub struct Distributor<Q: ?Sized> {
    queue: Arc<Q>,
    queue_name: String,
    output_root: PathBuf,
    metrics: Arc<Metrics>,
}

impl<Q: TaskQueue + ?Sized> Distributor<Q> {
    /// `output_root` is made absolute here so tasks carry absolute paths
    pub fn new(
        queue: Arc<Q>,
        queue_name: impl Into<String>,
        output_root: &Path,
    ) -> Result<Self, DistributeError> {
        Ok(Self {
            queue,
            queue_name: queue_name.into(),
            output_root: layout::absolute_root(output_root)?,
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Declare the durable queue and drop anything still waiting in it
    pub async fn reset_queue(&self) -> Result<u64, DistributeError> {
        self.queue.declare(&self.queue_name, true).await?;
        debug!(queue = %self.queue_name, "Declared queue");

        let purged = self.queue.purge(&self.queue_name).await?;
        debug!(queue = %self.queue_name, purged, "Purged queue");
        Ok(purged)
    }

    /// Create the partition's directory, returning its absolute path
    pub async fn ensure_partition_dir(&self, key: &str) -> Result<PathBuf, DistributeError> {
        let dir = layout::partition_dir(&self.output_root, key)?;
        layout::ensure_dir(&dir).await?;
        info!(path = %dir.display(), "Created path");
        Ok(dir)
    }

    /// Reset the queue, then publish one persistent task per URL
    ///
    /// A bad partition key fails the run before the queue is touched. Any
    /// later failure stops the run; tasks already published stay queued.
    pub async fn distribute(
        &self,
        partitions: &[Partition],
    ) -> Result<DistributionResult, DistributeError> {
        for partition in partitions {
            layout::partition_dir(&self.output_root, &partition.key)?;
        }

        let mut result = DistributionResult {
            purged: self.reset_queue().await?,
            ..Default::default()
        };

        for partition in partitions {
            let dir = self.ensure_partition_dir(&partition.key).await?;
            let path = dir.to_string_lossy();

            for url in &partition.urls {
                let body = Task::new(url.as_str(), &*path).to_bytes()?;
                self.queue
                    .publish(&self.queue_name, body, DeliveryMode::Persistent)
                    .await?;
                self.metrics.message_published();
                debug!(partition = %partition.key, url = %url, "Wrote task to queue");
            }

            result.partitions += 1;
            result.tasks_published += partition.urls.len();
            info!(partition = %partition.key, tasks = partition.urls.len(), "Wrote all tasks for partition");
        }

        Ok(result)
    }
}

/// Discover, connect, distribute
///
/// `partitions_file` overrides the configured discovery source.
pub async fn run(
    config: &Config,
    partitions_file: Option<PathBuf>,
) -> Result<DistributionResult, DistributeError> {
    let broker = BrokerClient::connect(
        &config.broker.url,
        config.broker.connect_timeout.as_duration(),
    )
    .await?;
    info!("Connected to broker, starting task distribution");

    let mut master = config.master.clone();
    if let Some(path) = partitions_file {
        master.discovery = DiscoverySource::File { path };
    }

    let source = discovery::from_config(&master)?;
    let policy = RetryPolicy::new(master.discovery_attempts);
    let partitions = with_retries(policy, || source.discover())
        .await
        .inspect_err(|e| error!(error = %e, "Discovery failed"))?;

    let distributor = Distributor::new(Arc::new(broker), config.broker.queue.clone(), &master.output_root)?;
    let result = distributor.distribute(&partitions).await?;

    info!(
        partitions = result.partitions,
        tasks = result.tasks_published,
        purged = result.purged,
        "Distribution complete"
    );
    distributor.metrics().log_summary("master");
    Ok(result)
}
