// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer
//!
//! Subscribes to one queue with a prefetch of 1 and hands each decoded message
//! to an application handler. A successful handler acknowledges the delivery,
//! a failing one rejects it with requeue so the broker redelivers it: delivery
//! is at-least-once and handlers must tolerate duplicates.
//!
//! Payloads that do not decode follow the [`MalformedPayloadPolicy`].

use crate::{
    broker::{BrokerChannel, BrokerConnection, DeliveryStream, RawDelivery},
    channel::{AmqpChannel, ChannelRole, ChannelState},
    configs::RabbitMQConfigs,
    errors::{AmqpError, HandlerError},
    message::InboundDelivery,
    queue::QueueDefinition,
    supervisor::ConnectionSupervisor,
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use std::{
    future::Future,
    marker::PhantomData,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Maximum number of unacknowledged deliveries pushed to one consumer.
pub const CONSUMER_PREFETCH: u16 = 1;

/// Application callback invoked once per delivery.
#[async_trait]
pub trait ConsumerHandler<M>: Send + Sync {
    async fn exec(&self, message: M) -> Result<(), HandlerError>;
}

#[async_trait]
impl<M, F, Fut> ConsumerHandler<M> for F
where
    M: Send + 'static,
    F: Fn(M) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, message: M) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// What to do with a delivery whose payload cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MalformedPayloadPolicy {
    /// Reject with requeue, like a handler failure.
    #[default]
    Requeue,
    /// Reject without requeue; the broker dead-letters it when the queue has
    /// a DLQ and drops it otherwise.
    Discard,
}

/// How a delivery was terminally resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Acked,
    Requeued,
    Discarded,
}

pub struct Consumer<M> {
    channel: Arc<AmqpChannel>,
    inbox: Arc<Inbox<M>>,
    owns_supervisor: bool,
}

impl<M: DeserializeOwned + Send + 'static> Consumer<M> {
    /// Creates a consumer with its own connection to the configured broker.
    pub fn new<H>(cfg: &RabbitMQConfigs, queue: impl Into<QueueDefinition>, handler: H) -> Self
    where
        H: ConsumerHandler<M> + 'static,
    {
        let mut consumer = Self::with_supervisor(ConnectionSupervisor::new(cfg), queue, handler);
        consumer.owns_supervisor = true;
        consumer
    }

    /// Creates a consumer on a connection shared with other channels.
    pub fn with_supervisor<H>(
        supervisor: Arc<ConnectionSupervisor>,
        queue: impl Into<QueueDefinition>,
        handler: H,
    ) -> Self
    where
        H: ConsumerHandler<M> + 'static,
    {
        let queue = queue.into();
        let inbox = Arc::new(Inbox::new(queue.name(), Arc::new(handler)));

        Consumer {
            channel: AmqpChannel::new(queue, inbox.clone(), supervisor),
            inbox,
            owns_supervisor: false,
        }
    }

    pub fn with_malformed_payload_policy(self, policy: MalformedPayloadPolicy) -> Self {
        *self
            .inbox
            .policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = policy;
        self
    }

    /// Waits until the subscription is established, retrying forever.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.channel.connect().await
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.channel.watch_state()
    }

    /// Stops consuming and closes the channel. Unresolved deliveries are
    /// requeued by the broker when the channel goes away.
    pub async fn destroy(&self) {
        self.channel.destroy().await;
        self.inbox.stop_worker().await;

        if self.owns_supervisor {
            self.channel.supervisor().shutdown().await;
        }
    }
}

/// The consumer side of the channel: handler, policy and the worker draining
/// the current subscription.
struct Inbox<M> {
    queue: String,
    handler: Arc<dyn ConsumerHandler<M>>,
    policy: Mutex<MalformedPayloadPolicy>,
    worker: Mutex<Option<JoinHandle<()>>>,
    // Held while a delivery is handled. A new subscription waits for it before
    // retiring the previous worker, so handlers never overlap or get cut off.
    in_flight: Arc<tokio::sync::Mutex<()>>,
    _message: PhantomData<fn() -> M>,
}

impl<M: DeserializeOwned + Send + 'static> Inbox<M> {
    fn new(queue: &str, handler: Arc<dyn ConsumerHandler<M>>) -> Self {
        Inbox {
            queue: queue.to_owned(),
            handler,
            policy: Mutex::new(MalformedPayloadPolicy::default()),
            worker: Mutex::new(None),
            in_flight: Arc::new(tokio::sync::Mutex::new(())),
            _message: PhantomData,
        }
    }

    async fn stop_worker(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(worker) = worker {
            worker.abort();
            let _ = worker.await;
        }
    }
}

#[async_trait]
impl<M: DeserializeOwned + Send + 'static> ChannelRole for Inbox<M> {
    async fn create_channel(
        &self,
        conn: &dyn BrokerConnection,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        conn.create_channel().await
    }

    async fn connected(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        let previous = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            let _idle = self.in_flight.lock().await;
            previous.abort();
        }

        debug!(queue = self.queue, "[AMQP] Begin Consume");
        channel.prefetch(CONSUMER_PREFETCH).await?;

        let tag = format!("{}-{}", self.queue, Uuid::new_v4());
        let stream = channel.consume(&self.queue, &tag).await?;

        let policy = *self.policy.lock().unwrap_or_else(PoisonError::into_inner);
        let worker = tokio::spawn(consume_deliveries(
            stream,
            channel,
            self.handler.clone(),
            policy,
            self.in_flight.clone(),
        ));

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);

        Ok(())
    }
}

async fn consume_deliveries<M: DeserializeOwned + Send + 'static>(
    mut stream: DeliveryStream,
    channel: Arc<dyn BrokerChannel>,
    handler: Arc<dyn ConsumerHandler<M>>,
    policy: MalformedPayloadPolicy,
    in_flight: Arc<tokio::sync::Mutex<()>>,
) {
    while let Some(result) = stream.next().await {
        match result {
            Ok(raw) => {
                let _guard = in_flight.lock().await;
                let res = handle_delivery(raw, channel.as_ref(), handler.as_ref(), policy).await;
                if let Err(err) = res {
                    error!(error = err.to_string(), "error consume msg");
                }
            }
            Err(err) => error!(error = err.to_string(), "errors consume msg"),
        }
    }

    // The subscription is gone (cancelled or channel lost). Closing the channel
    // hands recovery back to the channel lifecycle.
    warn!("delivery stream ended, closing channel");
    if let Err(err) = channel.close().await {
        debug!(error = err.to_string(), "closing consumer channel");
    }
}

/// Decodes `raw`, runs the handler and resolves the delivery exactly once.
pub(crate) async fn handle_delivery<M: DeserializeOwned + Send + 'static>(
    raw: RawDelivery,
    channel: &dyn BrokerChannel,
    handler: &dyn ConsumerHandler<M>,
    policy: MalformedPayloadPolicy,
) -> Result<Resolution, AmqpError> {
    let tag = raw.delivery_tag;

    let delivery = match InboundDelivery::<M>::decode(raw) {
        Ok(delivery) => delivery,
        Err(err) => {
            warn!(
                error = err.to_string(),
                delivery_tag = tag,
                "malformed payload"
            );

            return match policy {
                MalformedPayloadPolicy::Requeue => {
                    channel.reject(tag, true).await?;
                    Ok(Resolution::Requeued)
                }
                MalformedPayloadPolicy::Discard => {
                    channel.reject(tag, false).await?;
                    Ok(Resolution::Discarded)
                }
            };
        }
    };

    let outcome = AssertUnwindSafe(handler.exec(delivery.message))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {
            channel.ack(tag).await?;
            debug!(delivery_tag = tag, "[AMQP] Consumed");
            Ok(Resolution::Acked)
        }
        Ok(Err(err)) => {
            warn!(
                error = err.to_string(),
                delivery_tag = tag,
                "handler failed, requeuing message"
            );
            channel.reject(tag, true).await?;
            Ok(Resolution::Requeued)
        }
        Err(_) => {
            error!(delivery_tag = tag, "handler panicked, requeuing message");
            channel.reject(tag, true).await?;
            Ok(Resolution::Requeued)
        }
    }
}
