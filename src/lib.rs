//! Distributed page downloader over a durable task queue
//!
//! - [`queue`] / [`api`]: the broker (fjall-backed queues behind an HTTP API)
//! - [`messaging`]: the [`messaging::TaskQueue`] contract and its HTTP client
//! - [`discovery`] / [`master`]: find partitions and publish one task per URL
//! - [`worker`]: consume tasks, download through the fallback chain, ack

pub mod api;
pub mod config;
pub mod discovery;
pub mod humanize;
pub mod master;
pub mod messaging;
pub mod observability;
pub mod proto;
pub mod queue;
pub mod shutdown;
pub mod worker;
