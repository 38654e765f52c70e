use crate::queue::store::{FjallQueue, QueueError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A message handed to one consumer, pending acknowledgement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// Snapshot of a queue's counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub durable: bool,
    /// Messages waiting to be delivered
    pub ready: u64,
    /// Messages delivered but not yet acknowledged
    pub unacked: u64,
    pub consumers: u64,
}

#[derive(Debug)]
struct Consumer {
    queue: String,
    prefetch: u32,
    last_seen: Instant,
    held: HashSet<u64>,
}

#[derive(Debug)]
struct InFlight {
    queue: String,
    seq: u64,
    consumer: String,
}

struct BrokerState {
    store: FjallQueue,
    consumers: HashMap<String, Consumer>,
    /// delivery tag -> message it refers to
    in_flight: HashMap<u64, InFlight>,
    /// (queue, seq) pairs currently held by some consumer
    leased: HashSet<(String, u64)>,
    /// (queue, seq) pairs delivered at least once and returned unacked
    redelivered: HashSet<(String, u64)>,
}

impl BrokerState {
    /// Return every delivery held by `consumer_id` to its queue.
    fn release_consumer(&mut self, consumer_id: &str) -> usize {
        let Some(consumer) = self.consumers.remove(consumer_id) else {
            return 0;
        };

        let mut released = 0;
        for tag in consumer.held {
            if let Some(flight) = self.in_flight.remove(&tag) {
                let key = (flight.queue, flight.seq);
                self.leased.remove(&key);
                self.redelivered.insert(key);
                released += 1;
            }
        }
        released
    }
}

/// QueueBroker owns the durable store and implements delivery semantics
///
/// Semantics follow the usual work-queue model:
/// - Messages are delivered in FIFO order to whichever consumer asks first
/// - A consumer holds at most `prefetch` unacknowledged deliveries
/// - A message is removed from the store only when acknowledged
/// - Deliveries of a consumer that cancels or goes silent past the consumer
///   timeout return to the queue, flagged `redelivered`
///
/// All state sits behind one async mutex; fjall calls are short and never
/// held across an await point.
pub struct QueueBroker {
    state: Mutex<BrokerState>,
    available: Notify,
    next_tag: AtomicU64,
    consumer_timeout: Duration,
}

impl QueueBroker {
    pub fn new(store: FjallQueue, consumer_timeout: Duration) -> Self {
        info!(?consumer_timeout, "Creating QueueBroker");

        Self {
            state: Mutex::new(BrokerState {
                store,
                consumers: HashMap::new(),
                in_flight: HashMap::new(),
                leased: HashSet::new(),
                redelivered: HashSet::new(),
            }),
            available: Notify::new(),
            next_tag: AtomicU64::new(1),
            consumer_timeout,
        }
    }

    /// Declare `queue` (create if absent)
    pub async fn declare(&self, queue: &str, durable: bool) -> Result<QueueStats> {
        let mut state = self.state.lock().await;
        state.store.declare(queue, durable)?;
        drop(state);

        self.stats(queue).await
    }

    /// Remove every ready message; deliveries still held by consumers are kept
    pub async fn purge(&self, queue: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let BrokerState {
            store,
            leased,
            redelivered,
            ..
        } = &mut *state;

        let removed = store.purge_except(queue, |seq| leased.contains(&(queue.to_string(), seq)))?;
        redelivered.retain(|key| key.0 != queue || leased.contains(key));

        info!(queue, removed, "Queue purged");
        Ok(removed)
    }

    /// Append a message and wake any waiting consumer
    pub async fn publish(&self, queue: &str, body: &[u8], persistent: bool) -> Result<u64> {
        let seq = {
            let mut state = self.state.lock().await;
            state.store.append(queue, body, persistent)?
        };

        self.available.notify_waiters();
        Ok(seq)
    }

    /// Register a consumer on `queue` and return its id
    pub async fn subscribe(&self, queue: &str, prefetch: u32) -> Result<String> {
        if prefetch == 0 {
            return Err(QueueError::InvalidPrefetch);
        }

        let mut state = self.state.lock().await;
        if state.store.queue_meta(queue).is_none() {
            return Err(QueueError::QueueNotFound(queue.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        state.consumers.insert(
            id.clone(),
            Consumer {
                queue: queue.to_string(),
                prefetch,
                last_seen: Instant::now(),
                held: HashSet::new(),
            },
        );

        info!(queue, consumer = %id, prefetch, "Consumer subscribed");
        Ok(id)
    }

    /// Try to hand the next ready message to `consumer_id` without waiting
    ///
    /// Returns `None` when the queue has nothing ready or the consumer is
    /// already at its prefetch limit.
    pub async fn try_next(&self, consumer_id: &str) -> Result<Option<Delivery>> {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| QueueError::ConsumerNotFound(consumer_id.to_string()))?;
        consumer.last_seen = Instant::now();

        if consumer.held.len() >= consumer.prefetch as usize {
            debug!(consumer = consumer_id, "Prefetch limit reached");
            return Ok(None);
        }

        let queue = consumer.queue.clone();
        let leased = &state.leased;
        let Some(message) = state
            .store
            .first_where(&queue, |seq| leased.contains(&(queue.clone(), seq)))?
        else {
            return Ok(None);
        };

        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let key = (queue.clone(), message.seq);
        let redelivered = state.redelivered.contains(&key);

        state.leased.insert(key);
        state.in_flight.insert(
            tag,
            InFlight {
                queue: queue.clone(),
                seq: message.seq,
                consumer: consumer_id.to_string(),
            },
        );
        consumer.held.insert(tag);

        debug!(queue = %queue, seq = message.seq, tag, consumer = consumer_id, "Message delivered");

        Ok(Some(Delivery {
            tag,
            queue,
            redelivered,
            body: message.body,
        }))
    }

    /// Wait up to `wait` for a delivery for `consumer_id`
    pub async fn next_delivery(&self, consumer_id: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking so a publish in between is not missed
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_next(consumer_id).await? {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Acknowledge a delivery, deleting its message for good
    pub async fn ack(&self, consumer_id: &str, tag: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| QueueError::ConsumerNotFound(consumer_id.to_string()))?;
        consumer.last_seen = Instant::now();

        let owned = state
            .in_flight
            .get(&tag)
            .is_some_and(|flight| flight.consumer == consumer_id);
        if !owned {
            return Err(QueueError::UnknownDeliveryTag(tag));
        }

        if let Some(flight) = state.in_flight.remove(&tag) {
            consumer.held.remove(&tag);
            state.store.remove(&flight.queue, flight.seq)?;

            let key = (flight.queue, flight.seq);
            state.leased.remove(&key);
            state.redelivered.remove(&key);
            debug!(queue = %key.0, seq = key.1, tag, "Delivery acknowledged");
        }

        // The consumer has room for another message now
        self.available.notify_waiters();
        Ok(())
    }

    /// Unregister a consumer; its unacked deliveries go back to the queue
    pub async fn cancel(&self, consumer_id: &str) -> Result<usize> {
        let released = {
            let mut state = self.state.lock().await;
            if !state.consumers.contains_key(consumer_id) {
                return Err(QueueError::ConsumerNotFound(consumer_id.to_string()));
            }
            state.release_consumer(consumer_id)
        };

        info!(consumer = consumer_id, released, "Consumer cancelled");
        if released > 0 {
            self.available.notify_waiters();
        }
        Ok(released)
    }

    /// Drop consumers that have not been seen within the consumer timeout
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let released = {
            let mut state = self.state.lock().await;
            let expired: Vec<String> = state
                .consumers
                .iter()
                .filter(|(_, c)| now.duration_since(c.last_seen) > self.consumer_timeout)
                .map(|(id, _)| id.clone())
                .collect();

            let mut released = 0;
            for id in expired {
                let count = state.release_consumer(&id);
                warn!(consumer = %id, requeued = count, "Consumer timed out, requeueing deliveries");
                released += count;
            }
            released
        };

        if released > 0 {
            self.available.notify_waiters();
        }
        released
    }

    pub fn consumer_timeout(&self) -> Duration {
        self.consumer_timeout
    }

    /// Counters for `queue`
    pub async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let meta = state
            .store
            .queue_meta(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

        let stored = state.store.len(queue)?;
        let unacked = state.leased.iter().filter(|(q, _)| q == queue).count() as u64;
        let consumers = state.consumers.values().filter(|c| c.queue == queue).count() as u64;

        Ok(QueueStats {
            durable: meta.durable,
            ready: stored.saturating_sub(unacked),
            unacked,
            consumers,
        })
    }

    /// Flush the store to disk
    pub async fn flush(&self) -> Result<()> {
        self.state.lock().await.store.flush()
    }
}
