// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Producer
//!
//! Publishes JSON messages to one queue over a confirm channel. Every message
//! goes through an in-memory FIFO buffer first; a single drain task sends the
//! buffer head, waits for the broker confirmation and only then drops it. On a
//! failed confirmation the head stays in place, the channel is closed so the
//! lifecycle rebuilds it, and draining resumes from the same message once the
//! channel is ready again.
//!
//! Buffered messages survive disconnects but not the process.

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    channel::{AmqpChannel, ChannelRole, ChannelState},
    configs::RabbitMQConfigs,
    errors::AmqpError,
    message::PendingMessage,
    queue::QueueDefinition,
    supervisor::ConnectionSupervisor,
};
use async_trait::async_trait;
use serde::Serialize;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, error};

pub struct Producer {
    channel: Arc<AmqpChannel>,
    outbox: Arc<Outbox>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    owns_supervisor: bool,
}

impl Producer {
    /// Creates a producer with its own connection to the configured broker.
    pub fn new(cfg: &RabbitMQConfigs, queue: impl Into<QueueDefinition>) -> Producer {
        let mut producer = Self::with_supervisor(ConnectionSupervisor::new(cfg), queue);
        producer.owns_supervisor = true;
        producer
    }

    /// Creates a producer on a connection shared with other channels.
    ///
    /// [`Producer::destroy`] leaves a shared supervisor running.
    pub fn with_supervisor(
        supervisor: Arc<ConnectionSupervisor>,
        queue: impl Into<QueueDefinition>,
    ) -> Producer {
        let queue = queue.into();
        let outbox = Arc::new(Outbox::new(queue.name()));

        Producer {
            channel: AmqpChannel::new(queue, outbox.clone(), supervisor),
            outbox,
            drain_task: Mutex::new(None),
            owns_supervisor: false,
        }
    }

    /// Waits until the confirm channel is ready, retrying forever.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.spawn_drain();
        self.channel.connect().await
    }

    /// Queues `message` and wakes the drain task.
    ///
    /// Returns as soon as the message is buffered; it is sent whenever a
    /// channel is ready. Only a serialization failure is reported.
    pub fn publish<M: Serialize + ?Sized>(&self, message: &M) -> Result<(), AmqpError> {
        let id = self.outbox.push(message)?;
        debug!(id, queue = self.outbox.queue, "[AMQP] Publish");
        Ok(())
    }

    /// Number of messages still waiting for a broker confirmation.
    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.channel.watch_state()
    }

    /// Closes the channel and stops draining. Unconfirmed messages stay
    /// buffered; an owned supervisor is shut down as well.
    pub async fn destroy(&self) {
        self.channel.destroy().await;

        let task = self
            .drain_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        if self.owns_supervisor {
            self.channel.supervisor().shutdown().await;
        }
    }

    fn spawn_drain(&self) {
        let mut task = self
            .drain_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        *task = Some(tokio::spawn(drain_loop(
            self.channel.clone(),
            self.outbox.clone(),
            self.channel.shutdown_signal(),
        )));
    }
}

async fn drain_loop(
    channel: Arc<AmqpChannel>,
    outbox: Arc<Outbox>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = outbox.wake.notified() => {}
            _ = stop.wait_for(|stop| *stop) => break,
        }

        let Some(handle) = channel.handle() else {
            continue;
        };

        outbox.drain(handle.as_ref()).await;
    }
}

/// The producer side of the channel: the buffer and the confirm channel role.
pub(crate) struct Outbox {
    queue: String,
    buffer: Mutex<VecDeque<PendingMessage>>,
    next_id: AtomicU64,
    wake: Notify,
}

impl Outbox {
    pub(crate) fn new(queue: &str) -> Self {
        Outbox {
            queue: queue.to_owned(),
            buffer: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(0),
            wake: Notify::new(),
        }
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingMessage>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push<M: Serialize + ?Sized>(&self, message: &M) -> Result<u64, AmqpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = PendingMessage::encode(id, message)?;

        self.buffer().push_back(pending);
        self.wake.notify_one();

        Ok(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer().len()
    }

    /// Sends buffered messages oldest first, one confirmation at a time.
    ///
    /// Stops at the first failure, leaving the failed message at the head and
    /// closing `channel`.
    pub(crate) async fn drain(&self, channel: &dyn BrokerChannel) {
        loop {
            let Some(head) = self.buffer().front().cloned() else {
                return;
            };

            match channel.publish_confirmed(&self.queue, head.payload()).await {
                Ok(()) => {
                    self.confirm(head.id());
                    debug!(id = head.id(), queue = self.queue, "[AMQP] Published");
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        id = head.id(),
                        queue = self.queue,
                        "publish not confirmed, keeping message for the next channel"
                    );
                    if let Err(err) = channel.close().await {
                        error!(error = err.to_string(), "failure to close channel");
                    }
                    return;
                }
            }
        }
    }

    fn confirm(&self, id: u64) {
        let mut buffer = self.buffer();
        if buffer.front().is_some_and(|head| head.id() == id) {
            buffer.pop_front();
        }
    }
}

#[async_trait]
impl ChannelRole for Outbox {
    async fn create_channel(
        &self,
        conn: &dyn BrokerConnection,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        conn.create_confirm_channel().await
    }

    async fn connected(&self, _channel: Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        self.wake.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerChannel;
    use mockall::{predicate::eq, Sequence};
    use serde_json::json;

    #[tokio::test]
    async fn drains_in_publish_order() {
        let outbox = Outbox::new("jobs");
        for id in 1..=3 {
            outbox.push(&json!({ "id": id })).unwrap();
        }

        let mut seq = Sequence::new();
        let mut chan = MockBrokerChannel::new();
        for id in 1..=3 {
            let payload = format!(r#"{{"id":{id}}}"#).into_bytes();
            chan.expect_publish_confirmed()
                .withf(move |queue, body| queue == "jobs" && body == payload.as_slice())
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(()));
        }
        chan.expect_close().never();

        outbox.drain(&chan).await;

        assert_eq!(outbox.len(), 0);
    }

    #[tokio::test]
    async fn keeps_the_head_and_closes_the_channel_on_a_nack() {
        let outbox = Outbox::new("jobs");
        outbox.push(&json!({ "id": 1 })).unwrap();
        outbox.push(&json!({ "id": 2 })).unwrap();

        let mut chan = MockBrokerChannel::new();
        chan.expect_publish_confirmed()
            .times(1)
            .returning(|_, _| Err(AmqpError::PublishNacked));
        chan.expect_close().times(1).returning(|| Ok(()));

        outbox.drain(&chan).await;

        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.buffer().front().unwrap().payload(), br#"{"id":1}"#);
    }

    #[tokio::test]
    async fn resumes_from_the_failed_message() {
        let outbox = Outbox::new("jobs");
        outbox.push(&json!({ "id": 1 })).unwrap();
        outbox.push(&json!({ "id": 2 })).unwrap();

        let mut broken = MockBrokerChannel::new();
        broken
            .expect_publish_confirmed()
            .returning(|_, _| Err(AmqpError::PublishingError));
        broken.expect_close().returning(|| Ok(()));
        outbox.drain(&broken).await;

        let mut seq = Sequence::new();
        let mut healthy = MockBrokerChannel::new();
        healthy
            .expect_publish_confirmed()
            .with(eq("jobs"), eq(&br#"{"id":1}"#[..]))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        healthy
            .expect_publish_confirmed()
            .with(eq("jobs"), eq(&br#"{"id":2}"#[..]))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        outbox.drain(&healthy).await;

        assert_eq!(outbox.len(), 0);
    }

    #[test]
    fn unserializable_messages_are_not_buffered() {
        use std::collections::HashMap;

        let outbox = Outbox::new("jobs");
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], 1);

        let err = outbox.push(&bad).unwrap_err();

        assert!(matches!(err, AmqpError::SerializePayloadError(_)));
        assert_eq!(outbox.len(), 0);
    }

    #[tokio::test]
    async fn ready_channel_wakes_the_drain() {
        let outbox = Outbox::new("jobs");
        let chan: Arc<dyn BrokerChannel> = Arc::new(MockBrokerChannel::new());

        outbox.connected(chan).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), outbox.wake.notified())
            .await
            .unwrap();
    }
}
