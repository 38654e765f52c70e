use std::sync::Arc;

use crate::observability::Metrics;
use crate::queue::QueueBroker;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<QueueBroker>,
    pub metrics: Arc<Metrics>,
    /// Upper bound for a published message body
    pub max_message_bytes: usize,
}

impl AppState {
    pub fn new(broker: Arc<QueueBroker>, max_message_bytes: usize) -> Self {
        Self {
            broker,
            metrics: Arc::new(Metrics::new()),
            max_message_bytes,
        }
    }
}
