// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient RabbitMQ producer and consumer.
//!
//! Application code publishes or registers a handler; connection loss, channel
//! loss and broker nacks are recovered internally by reconnecting with a fixed
//! backoff.
//!
//! ```no_run
//! use resilient_amqp::{
//!     configs::RabbitMQConfigs, consumer::Consumer, errors::HandlerError, producer::Producer,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Job {
//!     id: u64,
//! }
//!
//! async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let cfg = RabbitMQConfigs::from_env()?;
//!
//!     let producer = Producer::new(&cfg, "jobs");
//!     producer.publish(&Job { id: 1 })?;
//!     producer.connect().await?;
//!
//!     let consumer = Consumer::<Job>::new(&cfg, "jobs", |job: Job| async move {
//!         println!("job {}", job.id);
//!         Ok::<(), HandlerError>(())
//!     });
//!     consumer.connect().await?;
//!     Ok(())
//! }
//! ```

mod message;

pub mod backoff;
pub mod broker;
pub mod channel;
pub mod configs;
pub mod consumer;
pub mod errors;
pub mod logging;
pub mod producer;
pub mod queue;
pub mod supervisor;
pub mod transport;

pub use message::{InboundDelivery, PendingMessage};
