//! Wire formats
//!
//! - [`Task`] is the message body published by the master and consumed by
//!   workers: UTF-8 JSON `{"url": "...", "path": "..."}`.
//! - The remaining types are the JSON bodies and header names of the broker's
//!   HTTP interface.
//!
//! ## Usage
//!
//! ```rust
//! use spiderq::proto::Task;
//!
//! let task = Task::new("https://google.com", "/srv/pages/RO");
//! let body = task.to_bytes().unwrap();
//! assert_eq!(Task::from_bytes(&body).unwrap(), task);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One URL to download, paired with its destination directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub url: String,
    /// Partition output directory (absolute or relative)
    pub path: String,
}

impl Task {
    pub fn new(url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
        }
    }

    pub fn directory(&self) -> PathBuf {
        Path::new(&self.path).to_path_buf()
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}

/// Publish header: `1` transient, `2` persistent
pub const HEADER_DELIVERY_MODE: &str = "x-delivery-mode";
/// Delivery response header carrying the tag to acknowledge
pub const HEADER_DELIVERY_TAG: &str = "x-delivery-tag";
/// Delivery response header, `true` when the message was delivered before
pub const HEADER_REDELIVERED: &str = "x-redelivered";
/// Delivery response header naming the source queue
pub const HEADER_QUEUE: &str = "x-queue";

fn default_durable() -> bool {
    true
}

/// `PUT /queues/{queue}` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclareRequest {
    #[serde(default = "default_durable")]
    pub durable: bool,
}

/// Queue counters returned by declare and stats
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatsResponse {
    pub queue: String,
    pub durable: bool,
    pub ready: u64,
    pub unacked: u64,
    pub consumers: u64,
}

/// `DELETE /queues/{queue}/messages` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub purged: u64,
}

/// `POST /queues/{queue}/consumers` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub prefetch: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub consumer_id: String,
}

/// `POST /consumers/{id}/deliveries` query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryQuery {
    pub wait_ms: Option<u64>,
}

/// Error body for every non-2xx broker response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}
