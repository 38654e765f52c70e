//! Broker HTTP interface
//!
//! Exposes a [`QueueBroker`](crate::queue::QueueBroker) to master and worker
//! processes; see [`BrokerClient`](crate::messaging::BrokerClient) for the
//! matching client.

mod error;
mod server;
pub mod services;
pub mod state;

pub use error::ApiError;
pub use server::{router, run};
