//! Task queue abstraction shared by master and workers
//!
//! `TaskQueue` is the broker contract: declare, purge, publish, subscribe
//! with a prefetch limit, receive, acknowledge and cancel. Two implementations
//! exist: the in-process [`QueueBroker`] (used by the broker server and by
//! tests) and the HTTP [`BrokerClient`] used by master and worker processes.

pub mod http;

use crate::queue::{Delivery, QueueBroker, QueueError, QueueStats};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use http::BrokerClient;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Cannot connect to message broker: {0}")]
    ConnectionError(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("Broker rejected request: {0}")]
    Rejected(String),

    #[error("Broker error: {0}")]
    Broker(String),
}

impl MessagingError {
    /// Whether the broker itself could not be reached
    pub fn is_connection(&self) -> bool {
        matches!(self, MessagingError::ConnectionError(_))
    }
}

impl From<QueueError> for MessagingError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::QueueNotFound(name) => MessagingError::QueueNotFound(name),
            QueueError::ConsumerNotFound(id) => MessagingError::ConsumerNotFound(id),
            QueueError::UnknownDeliveryTag(tag) => MessagingError::UnknownDeliveryTag(tag),
            e @ (QueueError::InvalidQueueName(_)
            | QueueError::InvalidPrefetch
            | QueueError::DurabilityMismatch(_)) => MessagingError::Rejected(e.to_string()),
            e => MessagingError::Broker(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;

/// Delivery mode of a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Lost if the broker restarts before delivery
    Transient,
    /// Survives a broker restart
    Persistent,
}

impl DeliveryMode {
    pub fn is_persistent(self) -> bool {
        matches!(self, DeliveryMode::Persistent)
    }

    /// AMQP-style numeric code (1 = transient, 2 = persistent)
    pub fn code(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DeliveryMode::Transient),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }
    }
}

/// Broker contract used by the distributor and the worker
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Create `queue` if absent; idempotent
    async fn declare(&self, queue: &str, durable: bool) -> Result<QueueStats>;

    /// Drop every ready message of `queue`, returning how many were removed
    async fn purge(&self, queue: &str) -> Result<u64>;

    /// Append `body` to `queue`
    async fn publish(&self, queue: &str, body: Vec<u8>, mode: DeliveryMode) -> Result<()>;

    /// Start consuming `queue` with at most `prefetch` unacked deliveries
    async fn subscribe(&self, queue: &str, prefetch: u32) -> Result<String>;

    /// Wait up to `wait` for the next delivery
    async fn next_delivery(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery; the message is gone afterwards
    async fn ack(&self, consumer: &str, tag: u64) -> Result<()>;

    /// Stop consuming; unacked deliveries are redelivered to other consumers
    async fn cancel(&self, consumer: &str) -> Result<()>;

    /// Counters for `queue`
    async fn stats(&self, queue: &str) -> Result<QueueStats>;
}

#[async_trait]
impl TaskQueue for QueueBroker {
    async fn declare(&self, queue: &str, durable: bool) -> Result<QueueStats> {
        Ok(QueueBroker::declare(self, queue, durable).await?)
    }

    async fn purge(&self, queue: &str) -> Result<u64> {
        Ok(QueueBroker::purge(self, queue).await?)
    }

    async fn publish(&self, queue: &str, body: Vec<u8>, mode: DeliveryMode) -> Result<()> {
        QueueBroker::publish(self, queue, &body, mode.is_persistent()).await?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str, prefetch: u32) -> Result<String> {
        Ok(QueueBroker::subscribe(self, queue, prefetch).await?)
    }

    async fn next_delivery(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>> {
        Ok(QueueBroker::next_delivery(self, consumer, wait).await?)
    }

    async fn ack(&self, consumer: &str, tag: u64) -> Result<()> {
        Ok(QueueBroker::ack(self, consumer, tag).await?)
    }

    async fn cancel(&self, consumer: &str) -> Result<()> {
        QueueBroker::cancel(self, consumer).await?;
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        Ok(QueueBroker::stats(self, queue).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::FjallQueue;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_delivery_mode_codes() {
        assert_eq!(DeliveryMode::Persistent.code(), 2);
        assert_eq!(DeliveryMode::from_code(1), Some(DeliveryMode::Transient));
        assert_eq!(DeliveryMode::from_code(7), None);
    }

    #[test]
    fn test_queue_error_mapping() {
        let err: MessagingError = QueueError::QueueNotFound("tasks".into()).into();
        assert!(matches!(err, MessagingError::QueueNotFound(q) if q == "tasks"));

        let err: MessagingError = QueueError::InvalidPrefetch.into();
        assert!(matches!(err, MessagingError::Rejected(_)));
        assert!(!err.is_connection());
    }

    #[tokio::test]
    async fn test_broker_through_trait_object() {
        let temp_dir = TempDir::new().unwrap();
        let store = FjallQueue::open(temp_dir.path()).unwrap();
        let queue: Arc<dyn TaskQueue> = Arc::new(QueueBroker::new(store, Duration::from_secs(60)));

        queue.declare("tasks", true).await.unwrap();
        queue
            .publish("tasks", b"payload".to_vec(), DeliveryMode::Persistent)
            .await
            .unwrap();

        let consumer = queue.subscribe("tasks", 1).await.unwrap();
        let delivery = queue
            .next_delivery(&consumer, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        queue.ack(&consumer, delivery.tag).await.unwrap();

        let stats = queue.stats("tasks").await.unwrap();
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.unacked, 0);
    }
}
