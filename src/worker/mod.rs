//! Download worker
//!
//! Consumes [`crate::proto::Task`] messages one at a time, downloads each
//! URL through the fallback chain in [`fetch`] and acknowledges the message
//! once the download reached a terminal state.

pub mod fetch;
pub mod http;
pub mod runner;

use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::messaging::{BrokerClient, MessagingError};

pub use fetch::{Downloader, FailureKind, FetchFailure, FetchState, Outcome, SkipReason};
pub use http::{ClientError, FetchSettings, HttpPageClient, PageClient};
pub use runner::{StopReason, TaskResult, Worker};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl WorkerError {
    pub fn is_connection(&self) -> bool {
        matches!(self, WorkerError::Messaging(e) if e.is_connection())
    }
}

/// Connect to the broker and consume until Ctrl+C / SIGTERM
pub async fn run(config: &Config) -> Result<StopReason, WorkerError> {
    let broker = BrokerClient::connect(
        &config.broker.url,
        config.broker.connect_timeout.as_duration(),
    )
    .await?;

    let client = HttpPageClient::new(&FetchSettings::from(&config.worker.fetch))?;

    let worker = Worker::new(
        Arc::new(broker),
        config.broker.queue.clone(),
        Downloader::new(client),
    )
    .with_poll_wait(config.worker.poll_wait.as_duration());

    let result = worker.run_until(crate::shutdown::shutdown_signal()).await;
    worker.metrics().log_summary("worker");
    result.map_err(WorkerError::from)
}
