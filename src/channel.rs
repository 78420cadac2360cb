// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Lifecycle
//!
//! An [`AmqpChannel`] owns at most one broker channel bound to one queue. It
//! follows the connection published by the [`ConnectionSupervisor`] and walks
//! `Disconnected → Connecting → Ready`, asserting the queue on the way. What
//! kind of channel is opened and what happens once it is ready is delegated
//! to a [`ChannelRole`], implemented by the producer and the consumer.
//!
//! When the channel closes while the connection stays up, the lifecycle task
//! waits one backoff interval before opening a new one; when the connection
//! itself is lost it waits for the supervisor to publish the next one.

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    errors::AmqpError,
    queue::QueueDefinition,
    supervisor::ConnectionSupervisor,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
}

/// Role-specific behaviour plugged into the channel lifecycle.
#[async_trait]
pub trait ChannelRole: Send + Sync + 'static {
    /// Opens the channel flavour this role needs on `conn`.
    async fn create_channel(
        &self,
        conn: &dyn BrokerConnection,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Called once the channel is `Ready` and its queue asserted.
    async fn connected(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), AmqpError>;
}

pub struct AmqpChannel {
    queue: QueueDefinition,
    role: Arc<dyn ChannelRole>,
    supervisor: Arc<ConnectionSupervisor>,
    handle: Mutex<Option<Arc<dyn BrokerChannel>>>,
    state: watch::Sender<ChannelState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpChannel {
    pub fn new(
        queue: QueueDefinition,
        role: Arc<dyn ChannelRole>,
        supervisor: Arc<ConnectionSupervisor>,
    ) -> Arc<AmqpChannel> {
        Arc::new(AmqpChannel {
            queue,
            role,
            supervisor,
            handle: Mutex::new(None),
            state: watch::Sender::new(ChannelState::Disconnected),
            shutdown: watch::Sender::new(false),
            task: Mutex::new(None),
        })
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// The live channel handle, if the channel is ready.
    pub(crate) fn handle(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn set_handle(&self, chan: Option<Arc<dyn BrokerChannel>>) -> Option<Arc<dyn BrokerChannel>> {
        std::mem::replace(
            &mut *self.handle.lock().unwrap_or_else(PoisonError::into_inner),
            chan,
        )
    }

    /// Waits for a connection, then for the channel to become `Ready`.
    ///
    /// Like the supervisor this retries forever and only fails once the
    /// channel or its supervisor has been shut down.
    pub async fn connect(self: &Arc<Self>) -> Result<(), AmqpError> {
        if *self.shutdown.borrow() {
            return Err(AmqpError::ShuttingDown);
        }

        self.supervisor.connect().await?;
        self.spawn();

        let mut state = self.state.subscribe();
        let mut stop = self.shutdown.subscribe();

        tokio::select! {
            res = state.wait_for(|s| *s == ChannelState::Ready) => {
                res.map(|_| ()).map_err(|_| AmqpError::ShuttingDown)
            }
            _ = stop.wait_for(|stop| *stop) => Err(AmqpError::ShuttingDown),
        }
    }

    /// Stops the lifecycle task and closes the live channel handle.
    pub async fn destroy(&self) {
        self.shutdown.send_replace(true);

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = err.to_string(), "channel task failed");
            }
        }

        self.teardown().await;
    }

    fn spawn(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let this = self.clone();
        *task = Some(tokio::spawn(async move { this.run().await }));
    }

    async fn run(self: Arc<Self>) {
        let mut conns = self.supervisor.subscribe();
        let mut stop = self.shutdown.subscribe();
        let backoff = self.supervisor.backoff();

        loop {
            let conn = tokio::select! {
                res = conns.wait_for(|c| c.as_ref().is_some_and(|c| c.is_open())) => match res {
                    Ok(slot) => (*slot).clone(),
                    Err(_) => None,
                },
                _ = stop.wait_for(|stop| *stop) => None,
            };

            let Some(conn) = conn else {
                break;
            };

            if let Some(chan) = self.spawn_channel(conn.as_ref()).await {
                tokio::select! {
                    _ = chan.closed() => warn!(queue = self.queue.name(), "amqp channel closed"),
                    _ = conn.closed() => warn!(queue = self.queue.name(), "amqp connection lost"),
                    _ = stop.wait_for(|stop| *stop) => break,
                }

                self.set_handle(None);
                self.state.send_replace(ChannelState::Disconnected);
                let _ = chan.close().await;
            }

            // A new connection is announced by the supervisor, which already
            // waited; only a channel-level failure needs its own delay.
            if conn.is_open() && !backoff.wait(&mut stop).await {
                break;
            }
        }

        self.teardown().await;
    }

    async fn teardown(&self) {
        self.state.send_replace(ChannelState::Closing);

        if let Some(chan) = self.set_handle(None) {
            if let Err(err) = chan.close().await {
                error!(
                    error = err.to_string(),
                    queue = self.queue.name(),
                    "failure to close channel"
                );
            }
        }

        self.state.send_replace(ChannelState::Disconnected);
    }

    /// Runs `Connecting → Ready` on `conn`.
    ///
    /// Any failure is logged, the partially created channel is closed and the
    /// state falls back to `Disconnected`.
    pub(crate) async fn spawn_channel(
        &self,
        conn: &dyn BrokerConnection,
    ) -> Option<Arc<dyn BrokerChannel>> {
        self.state.send_replace(ChannelState::Connecting);
        debug!(queue = self.queue.name(), "creating channel");

        let chan = match self.role.create_channel(conn).await {
            Ok(chan) => chan,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.queue.name(),
                    "failure to create channel"
                );
                self.state.send_replace(ChannelState::Disconnected);
                return None;
            }
        };

        if let Err(err) = self.ready(&chan).await {
            error!(
                error = err.to_string(),
                queue = self.queue.name(),
                "failure to set up channel"
            );
            self.set_handle(None);
            let _ = chan.close().await;
            self.state.send_replace(ChannelState::Disconnected);
            return None;
        }

        Some(chan)
    }

    async fn ready(&self, chan: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        chan.assert_queue(&self.queue).await?;

        self.set_handle(Some(chan.clone()));
        self.state.send_replace(ChannelState::Ready);
        debug!(queue = self.queue.name(), "channel ready");

        self.role.connected(chan.clone()).await
    }
}
