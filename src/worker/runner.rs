//! Consumption loop: receive a task, run the download, acknowledge

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::fetch::{Downloader, Outcome};
use super::http::PageClient;
use crate::messaging::{MessagingError, TaskQueue};
use crate::observability::Metrics;
use crate::proto::Task;
use crate::queue::Delivery;

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    /// Body was not a valid task; acknowledged and dropped
    Poison,
    Completed(Outcome),
}

/// Why the loop stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
}

/// Unacknowledged deliveries a worker may hold; one task at a time
pub const PREFETCH: u32 = 1;

/// A single-consumer worker over any [`TaskQueue`]
pub struct Worker<Q: ?Sized, C> {
    queue: Arc<Q>,
    queue_name: String,
    downloader: Downloader<C>,
    poll_wait: Duration,
    metrics: Arc<Metrics>,
}

impl<Q, C> Worker<Q, C>
where
    Q: TaskQueue + ?Sized,
    C: PageClient,
{
    pub fn new(queue: Arc<Q>, queue_name: impl Into<String>, downloader: Downloader<C>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            downloader,
            poll_wait: Duration::from_secs(30),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Declare the queue durable and register as a consumer
    pub async fn subscribe(&self) -> Result<String, MessagingError> {
        self.queue.declare(&self.queue_name, true).await?;
        let consumer = self.queue.subscribe(&self.queue_name, PREFETCH).await?;
        info!(queue = %self.queue_name, consumer = %consumer, prefetch = PREFETCH, "Subscribed to task queue");
        Ok(consumer)
    }

    /// Process one delivery and acknowledge it
    ///
    /// The ack is sent only after the download reached a terminal state, so a
    /// worker that dies mid-download leaves the task to be redelivered.
    pub async fn handle_delivery(
        &self,
        consumer: &str,
        delivery: Delivery,
    ) -> Result<TaskResult, MessagingError> {
        let result = match Task::from_bytes(&delivery.body) {
            Ok(task) => TaskResult::Completed(self.process(&task, delivery.redelivered).await),
            Err(e) => {
                self.metrics.poison_message();
                error!(
                    tag = delivery.tag,
                    error = %e,
                    body = %String::from_utf8_lossy(&delivery.body),
                    "Malformed task, dropping"
                );
                TaskResult::Poison
            }
        };

        self.queue.ack(consumer, delivery.tag).await?;
        Ok(result)
    }

    async fn process(&self, task: &Task, redelivered: bool) -> Outcome {
        info!(url = %task.url, path = %task.path, redelivered, "Downloading");

        let outcome = self
            .downloader
            .fetch(&task.url, &task.directory())
            .await;

        match &outcome {
            Outcome::Written { path, bytes, .. } => {
                self.metrics.page_written();
                info!(path = %path.display(), bytes, "Page saved");
            }
            Outcome::Skipped { .. } => self.metrics.page_skipped(),
        }
        outcome
    }

    /// Consume until `shutdown` resolves
    ///
    /// On shutdown the delivery in progress is abandoned unacknowledged and
    /// the consumer is cancelled so the broker requeues it. Broker errors end
    /// the loop with `Err`; a consumer the broker has forgotten (for example
    /// after the consumer timeout) is re-registered.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<StopReason, MessagingError>
    where
        F: Future<Output = ()>,
    {
        let mut consumer = self.subscribe().await?;
        tokio::pin!(shutdown);

        loop {
            let step = self.step(&consumer);

            let result = tokio::select! {
                _ = &mut shutdown => None,
                result = step => Some(result),
            };

            match result {
                None => break,
                Some(Ok(())) => {}
                Some(Err(MessagingError::ConsumerNotFound(_))) => {
                    warn!(consumer = %consumer, "Broker dropped consumer, subscribing again");
                    consumer = self.subscribe().await?;
                }
                Some(Err(e)) => return Err(e),
            }
        }

        info!("Interrupt received, stopping consumption");
        if let Err(e) = self.queue.cancel(&consumer).await {
            warn!(consumer = %consumer, error = %e, "Failed to cancel consumer");
        }
        Ok(StopReason::Interrupted)
    }

    async fn step(&self, consumer: &str) -> Result<(), MessagingError> {
        if let Some(delivery) = self.queue.next_delivery(consumer, self.poll_wait).await? {
            self.handle_delivery(consumer, delivery).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::DeliveryMode;
    use crate::queue::{FjallQueue, QueueBroker};
    use crate::worker::fetch::{FailureKind, FetchFailure, SkipReason};
    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::TempDir;
    use tokio::sync::Notify;
    use url::Url;

    /// Fixed answer per host, with an optional gate that blocks every request
    #[derive(Default)]
    struct FakeSites {
        failures: Vec<(&'static str, FailureKind)>,
        blocked: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl PageClient for FakeSites {
        async fn get(&self, url: &Url, _verify_tls: bool) -> Result<Bytes, FetchFailure> {
            if let Some(gate) = &self.blocked {
                gate.notify_one();
                std::future::pending::<()>().await;
            }

            let host = url.host_str().unwrap_or_default();
            match self.failures.iter().find(|(h, _)| *h == host) {
                Some((_, kind)) => Err(FetchFailure::new(*kind, "fake")),
                None => Ok(Bytes::from(format!("<html>{}</html>", host))),
            }
        }
    }

    struct Harness {
        _data: TempDir,
        out: TempDir,
        broker: Arc<QueueBroker>,
    }

    impl Harness {
        async fn new() -> Self {
            let data = TempDir::new().unwrap();
            let store = FjallQueue::open(data.path()).unwrap();
            let broker = Arc::new(QueueBroker::new(store, Duration::from_secs(60)));
            broker.declare("tasks", true).await.unwrap();
            Self {
                _data: data,
                out: TempDir::new().unwrap(),
                broker,
            }
        }

        async fn publish_task(&self, url: &str) {
            let task = Task::new(url, self.out.path().to_string_lossy());
            TaskQueue::publish(
                self.broker.as_ref(),
                "tasks",
                task.to_bytes().unwrap(),
                DeliveryMode::Persistent,
            )
            .await
            .unwrap();
        }

        fn worker(&self, sites: FakeSites) -> Worker<QueueBroker, FakeSites> {
            Worker::new(self.broker.clone(), "tasks", Downloader::new(sites))
                .with_poll_wait(Duration::from_millis(50))
        }

        async fn next(&self, consumer: &str) -> Delivery {
            self.broker
                .next_delivery(consumer, Duration::from_secs(1))
                .await
                .unwrap()
                .expect("a delivery")
        }
    }

    #[tokio::test]
    async fn test_writes_page_and_acks() {
        let h = Harness::new().await;
        h.publish_task("https://google.com").await;
        let worker = h.worker(FakeSites::default());
        let consumer = worker.subscribe().await.unwrap();

        let delivery = h.next(&consumer).await;
        let result = worker.handle_delivery(&consumer, delivery).await.unwrap();

        assert!(matches!(result, TaskResult::Completed(ref o) if o.is_written()));
        assert!(h.out.path().join("google.com.html").exists());
        let stats = h.broker.stats("tasks").await.unwrap();
        assert_eq!((stats.ready, stats.unacked), (0, 0));
        assert_eq!(worker.metrics().snapshot().pages_written, 1);
    }

    #[tokio::test]
    async fn test_tls_failure_is_skipped_and_acked() {
        let h = Harness::new().await;
        h.publish_task("https://example.com").await;
        let sites = FakeSites {
            failures: vec![("example.com", FailureKind::Tls)],
            ..Default::default()
        };
        let worker = h.worker(sites);
        let consumer = worker.subscribe().await.unwrap();

        let delivery = h.next(&consumer).await;
        let result = worker.handle_delivery(&consumer, delivery).await.unwrap();

        match result {
            TaskResult::Completed(outcome) => {
                assert_eq!(outcome.skip_reason(), Some(SkipReason::TlsFailure))
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(std::fs::read_dir(h.out.path()).unwrap().count(), 0);
        assert_eq!(h.broker.stats("tasks").await.unwrap().unacked, 0);
        assert_eq!(worker.metrics().snapshot().pages_skipped, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_writes_www_page() {
        let h = Harness::new().await;
        h.publish_task("https://example.com").await;
        let sites = FakeSites {
            failures: vec![("example.com", FailureKind::Connect)],
            ..Default::default()
        };
        let worker = h.worker(sites);
        let consumer = worker.subscribe().await.unwrap();

        let delivery = h.next(&consumer).await;
        worker.handle_delivery(&consumer, delivery).await.unwrap();

        assert!(h.out.path().join("www.example.com.html").exists());
    }

    #[tokio::test]
    async fn test_poison_message_is_acked() {
        let h = Harness::new().await;
        h.broker.publish("tasks", b"not json", true).await.unwrap();
        let worker = h.worker(FakeSites::default());
        let consumer = worker.subscribe().await.unwrap();

        let delivery = h.next(&consumer).await;
        let result = worker.handle_delivery(&consumer, delivery).await.unwrap();

        assert_eq!(result, TaskResult::Poison);
        let stats = h.broker.stats("tasks").await.unwrap();
        assert_eq!((stats.ready, stats.unacked), (0, 0));
        assert_eq!(worker.metrics().snapshot().poison_messages, 1);
    }

    #[tokio::test]
    async fn test_consumer_holds_one_task_at_a_time() {
        let h = Harness::new().await;
        h.publish_task("https://google.com").await;
        h.publish_task("https://yahoo.com").await;
        let worker = h.worker(FakeSites::default());
        let consumer = worker.subscribe().await.unwrap();

        let first = h.broker.try_next(&consumer).await.unwrap();
        let second = h.broker.try_next(&consumer).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        let stats = h.broker.stats("tasks").await.unwrap();
        assert_eq!((stats.ready, stats.unacked), (1, 1));

        worker
            .handle_delivery(&consumer, first.unwrap())
            .await
            .unwrap();
        assert!(h.broker.try_next(&consumer).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_until_processes_then_stops() {
        let h = Harness::new().await;
        h.publish_task("https://google.com").await;
        h.publish_task("https://yahoo.com").await;
        let worker = h.worker(FakeSites::default());

        let out = h.out.path().to_path_buf();
        let shutdown = async move {
            while !(out.join("google.com.html").exists() && out.join("yahoo.com.html").exists()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        let stop = tokio::time::timeout(Duration::from_secs(5), worker.run_until(shutdown))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stop, StopReason::Interrupted);
        let stats = h.broker.stats("tasks").await.unwrap();
        assert_eq!(stats.consumers, 0);
    }

    #[tokio::test]
    async fn test_interrupt_mid_download_requeues_task() {
        let h = Harness::new().await;
        h.publish_task("https://google.com").await;
        let gate = Arc::new(Notify::new());
        let sites = FakeSites {
            blocked: Some(gate.clone()),
            ..Default::default()
        };
        let worker = h.worker(sites);

        // Stop as soon as the download has started
        let started = gate.clone();
        let stop = worker
            .run_until(async move { started.notified().await })
            .await
            .unwrap();

        assert_eq!(stop, StopReason::Interrupted);
        assert!(!h.out.path().join("google.com.html").exists());
        let stats = h.broker.stats("tasks").await.unwrap();
        assert_eq!((stats.ready, stats.unacked, stats.consumers), (1, 0, 0));

        // The next consumer sees it flagged as redelivered
        let consumer = h.broker.subscribe("tasks", 1).await.unwrap();
        let delivery = h.broker.try_next(&consumer).await.unwrap().unwrap();
        assert!(delivery.redelivered);
    }
}
