pub mod broker;
pub mod store;

pub use broker::{Delivery, QueueBroker, QueueStats};
pub use store::{FjallQueue, QueueError, validate_queue_name};
