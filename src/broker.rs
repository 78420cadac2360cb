// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Seam
//!
//! The connection, channel and queue primitives the lifecycle code drives.
//! The production implementation lives in [`crate::transport`] on top of
//! lapin; tests plug in mocks or an in-memory broker.
//!
//! Client-library events (error, close) surface as the `closed()` futures so
//! the supervisor and the channel lifecycle can wait on them with
//! `tokio::select!` instead of registering callbacks.

use crate::{errors::AmqpError, queue::QueueDefinition};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// One message as pushed by the broker, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
}

/// Stream of deliveries for one consumer subscription. It ends when the
/// channel carrying the subscription goes away.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, AmqpError>>;

/// Opens transport sessions with the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live transport session.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a plain channel.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Opens a channel with publisher confirms enabled.
    async fn create_confirm_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn is_open(&self) -> bool;

    /// Resolves once the connection is lost or closed.
    async fn closed(&self);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A logical channel multiplexed over a [`BrokerConnection`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares the queue; succeeds when it already exists with the same
    /// arguments.
    async fn assert_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries pushed to this channel.
    async fn prefetch(&self, count: u16) -> Result<(), AmqpError>;

    /// Publishes `payload` to `queue` and waits for the broker confirmation.
    async fn publish_confirmed(&self, queue: &str, payload: &[u8]) -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    /// Resolves once the channel is closed, by the broker or locally.
    async fn closed(&self);

    async fn close(&self) -> Result<(), AmqpError>;
}
