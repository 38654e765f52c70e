use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Metadata decode error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid queue name: {0}")]
    InvalidQueueName(String),

    #[error("Queue '{0}' already declared with different durability")]
    DurabilityMismatch(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("Prefetch must be at least 1")]
    InvalidPrefetch,

    #[error("Corrupt record in queue '{0}'")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

const FLAG_PERSISTENT: u8 = 0b0000_0001;
const NEXT_SEQ_PREFIX: &str = "next_seq/";
const QUEUE_PREFIX: &str = "queue/";

/// Queue names become key prefixes, so they are restricted to a safe alphabet.
pub fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(QueueError::InvalidQueueName(
            "must be 1 to 255 characters".to_string(),
        ));
    }

    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
    {
        return Err(QueueError::InvalidQueueName(format!(
            "character '{}' is not allowed",
            c
        )));
    }

    Ok(())
}

/// Persistent queue declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMeta {
    pub durable: bool,
    pub declared_at_ms: i64,
}

/// A message as stored: body plus delivery-mode flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub seq: u64,
    pub persistent: bool,
    pub body: Vec<u8>,
}

/// FjallQueue persists named queues and their messages
///
/// Layout:
/// - `messages` partition: `<queue> 0x00 <seq u64 big-endian>` → `<flags u8><body>`
/// - `metadata` partition: `queue/<name>` → QueueMeta (JSON),
///   `next_seq/<name>` → u64 big-endian
///
/// Big-endian sequence keys make prefix iteration yield messages in publish
/// order. Messages stay in the store until acknowledged, so anything delivered
/// but unacked when the broker stops is delivered again after restart.
pub struct FjallQueue {
    keyspace: Keyspace,
    messages: PartitionHandle,
    metadata: PartitionHandle,
    queues: HashMap<String, QueueMeta>,
    next_seq: HashMap<String, u64>,
}

impl FjallQueue {
    /// Open or create the store, then apply restart semantics:
    /// non-durable queues and non-persistent messages do not survive.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening FjallQueue at: {}", path.as_ref().display());

        let keyspace = Config::new(path).open()?;
        let messages = keyspace.open_partition("messages", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        let mut store = Self {
            keyspace,
            messages,
            metadata,
            queues: HashMap::new(),
            next_seq: HashMap::new(),
        };
        store.recover()?;

        info!(queues = store.queues.len(), "FjallQueue opened");
        Ok(store)
    }

    fn recover(&mut self) -> Result<()> {
        let mut declared = Vec::new();
        for item in self.metadata.prefix(QUEUE_PREFIX) {
            let (key, value) = item?;
            let name = String::from_utf8_lossy(&key[QUEUE_PREFIX.len()..]).into_owned();
            let meta: QueueMeta = serde_json::from_slice(&value)?;
            declared.push((name, meta));
        }

        for (name, meta) in declared {
            if !meta.durable {
                self.remove_all(&name, |_| true)?;
                self.metadata.remove(format!("{QUEUE_PREFIX}{name}"))?;
                self.metadata.remove(format!("{NEXT_SEQ_PREFIX}{name}"))?;
                info!(queue = %name, "Dropped non-durable queue on restart");
                continue;
            }

            let dropped = self.remove_all(&name, |flags| flags & FLAG_PERSISTENT == 0)?;
            if dropped > 0 {
                info!(queue = %name, dropped, "Dropped transient messages on restart");
            }

            let next = self
                .metadata
                .get(format!("{NEXT_SEQ_PREFIX}{name}"))?
                .map(|bytes| decode_u64(&bytes))
                .transpose()
                .map_err(|_| QueueError::Corrupt(name.clone()))?
                .unwrap_or(0);

            self.next_seq.insert(name.clone(), next);
            self.queues.insert(name, meta);
        }

        Ok(())
    }

    /// Declare a queue, creating it if absent
    ///
    /// Re-declaring with the same durability is a no-op; a conflicting
    /// durability is rejected rather than silently changed.
    pub fn declare(&mut self, name: &str, durable: bool) -> Result<QueueMeta> {
        validate_queue_name(name)?;

        if let Some(existing) = self.queues.get(name) {
            if existing.durable != durable {
                return Err(QueueError::DurabilityMismatch(name.to_string()));
            }
            return Ok(*existing);
        }

        let meta = QueueMeta {
            durable,
            declared_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        self.metadata
            .insert(format!("{QUEUE_PREFIX}{name}"), serde_json::to_vec(&meta)?)?;
        self.queues.insert(name.to_string(), meta);
        self.next_seq.entry(name.to_string()).or_insert(0);

        debug!(queue = name, durable, "Queue declared");
        Ok(meta)
    }

    pub fn queue_meta(&self, name: &str) -> Option<QueueMeta> {
        self.queues.get(name).copied()
    }

    fn require(&self, name: &str) -> Result<()> {
        if self.queues.contains_key(name) {
            Ok(())
        } else {
            Err(QueueError::QueueNotFound(name.to_string()))
        }
    }

    /// Append a message to the tail of `queue`, returning its sequence number
    pub fn append(&mut self, queue: &str, body: &[u8], persistent: bool) -> Result<u64> {
        self.require(queue)?;

        let next = self.next_seq.entry(queue.to_string()).or_insert(0);
        let seq = *next;

        let mut value = Vec::with_capacity(body.len() + 1);
        value.push(if persistent { FLAG_PERSISTENT } else { 0 });
        value.extend_from_slice(body);

        let mut batch = self.keyspace.batch();
        batch.insert(&self.messages, message_key(queue, seq), value);
        batch.insert(
            &self.metadata,
            format!("{NEXT_SEQ_PREFIX}{queue}"),
            (seq + 1).to_be_bytes().to_vec(),
        );
        batch.commit()?;
        *next = seq + 1;

        debug!(queue, seq, persistent, "Message appended");
        Ok(seq)
    }

    /// First message in `queue` whose sequence is not rejected by `skip`
    pub fn first_where(
        &self,
        queue: &str,
        skip: impl Fn(u64) -> bool,
    ) -> Result<Option<StoredMessage>> {
        self.require(queue)?;

        for item in self.messages.prefix(queue_prefix(queue)) {
            let (key, value) = item?;
            let seq = seq_from_key(&key).ok_or_else(|| QueueError::Corrupt(queue.to_string()))?;
            if skip(seq) {
                continue;
            }
            let (flags, body) = value
                .split_first()
                .ok_or_else(|| QueueError::Corrupt(queue.to_string()))?;
            return Ok(Some(StoredMessage {
                seq,
                persistent: flags & FLAG_PERSISTENT != 0,
                body: body.to_vec(),
            }));
        }

        Ok(None)
    }

    /// Delete one message permanently
    pub fn remove(&self, queue: &str, seq: u64) -> Result<()> {
        self.messages.remove(message_key(queue, seq))?;
        Ok(())
    }

    /// Delete every message of `queue` except those `keep` selects; returns the count removed
    pub fn purge_except(&self, queue: &str, keep: impl Fn(u64) -> bool) -> Result<u64> {
        self.require(queue)?;

        let mut batch = self.keyspace.batch();
        let mut removed = 0;
        for item in self.messages.prefix(queue_prefix(queue)) {
            let (key, _) = item?;
            let seq = seq_from_key(&key).ok_or_else(|| QueueError::Corrupt(queue.to_string()))?;
            if keep(seq) {
                continue;
            }
            batch.remove(&self.messages, key);
            removed += 1;
        }
        batch.commit()?;

        Ok(removed)
    }

    /// Number of stored messages in `queue`, delivered-but-unacked included
    pub fn len(&self, queue: &str) -> Result<u64> {
        self.require(queue)?;

        let mut count = 0;
        for item in self.messages.prefix(queue_prefix(queue)) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn remove_all(&self, queue: &str, select: impl Fn(u8) -> bool) -> Result<u64> {
        let mut batch = self.keyspace.batch();
        let mut removed = 0;
        for item in self.messages.prefix(queue_prefix(queue)) {
            let (key, value) = item?;
            if value.first().is_some_and(|flags| select(*flags)) || value.is_empty() {
                batch.remove(&self.messages, key);
                removed += 1;
            }
        }
        batch.commit()?;
        Ok(removed)
    }

    /// Flush all writes to disk
    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

fn queue_prefix(queue: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(queue.len() + 1);
    prefix.extend_from_slice(queue.as_bytes());
    prefix.push(0);
    prefix
}

fn message_key(queue: &str, seq: u64) -> Vec<u8> {
    let mut key = queue_prefix(queue);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn seq_from_key(key: &[u8]) -> Option<u64> {
    let tail = key.len().checked_sub(8).map(|start| &key[start..])?;
    decode_u64(tail).ok()
}

fn decode_u64(bytes: &[u8]) -> std::result::Result<u64, std::array::TryFromSliceError> {
    <[u8; 8]>::try_from(bytes).map(u64::from_be_bytes)
}
