// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! Owns the broker connection. A single background task establishes it,
//! watches for its loss and reconnects after a fixed [`Backoff`], forever,
//! until [`ConnectionSupervisor::shutdown`] is called.
//!
//! The current connection is published on a `watch` channel. Channels
//! subscribe to it instead of holding the connection themselves, so only the
//! supervisor ever replaces or closes it.

use crate::{
    backoff::Backoff,
    broker::{BrokerConnection, Connector},
    configs::RabbitMQConfigs,
    errors::AmqpError,
    transport::LapinConnector,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

pub(crate) type ConnectionSlot = Option<Arc<dyn BrokerConnection>>;

pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    connection: watch::Sender<ConnectionSlot>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    /// Creates a supervisor connecting with lapin to the configured broker.
    pub fn new(cfg: &RabbitMQConfigs) -> Arc<ConnectionSupervisor> {
        Self::with_connector(
            LapinConnector::new(cfg),
            Backoff::new(cfg.reconnect_interval()),
        )
    }

    pub fn with_connector(connector: Arc<dyn Connector>, backoff: Backoff) -> Arc<Self> {
        Arc::new(ConnectionSupervisor {
            connector,
            backoff,
            connection: watch::Sender::new(None),
            shutdown: watch::Sender::new(false),
            task: Mutex::new(None),
        })
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .borrow()
            .as_ref()
            .is_some_and(|conn| conn.is_open())
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionSlot> {
        self.connection.subscribe()
    }

    /// Starts the supervision loop if needed and waits for a usable connection.
    ///
    /// Connection failures are retried without limit, so this only returns an
    /// error once the supervisor has been shut down.
    pub async fn connect(self: &Arc<Self>) -> Result<(), AmqpError> {
        if self.is_shut_down() {
            return Err(AmqpError::ShuttingDown);
        }

        self.spawn();

        let mut conn = self.connection.subscribe();
        let mut stop = self.shutdown.subscribe();

        tokio::select! {
            res = conn.wait_for(|c| c.as_ref().is_some_and(|c| c.is_open())) => {
                res.map(|_| ()).map_err(|_| AmqpError::ShuttingDown)
            }
            _ = stop.wait_for(|stop| *stop) => Err(AmqpError::ShuttingDown),
        }
    }

    /// Stops the reconnect loop and closes the live connection, if any.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = err.to_string(), "connection supervisor task failed");
            }
        }

        if let Some(conn) = self.connection.send_replace(None) {
            let _ = conn.close().await;
        }
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
        let mut stop = self.shutdown.subscribe();

        loop {
            let Some(conn) = self.establish(&mut stop).await else {
                break;
            };

            info!("amqp connection established");
            self.connection.send_replace(Some(conn.clone()));

            // Errors are only logged by the transport; the close that follows
            // is what drives the reconnect.
            tokio::select! {
                _ = conn.closed() => {}
                _ = stop.wait_for(|stop| *stop) => break,
            }

            self.connection.send_replace(None);
            warn!(
                retry_in_ms = self.backoff.interval().as_millis() as u64,
                "amqp connection lost"
            );

            if !self.backoff.wait(&mut stop).await {
                break;
            }
        }

        if let Some(conn) = self.connection.send_replace(None) {
            let _ = conn.close().await;
        }
        debug!("connection supervisor stopped");
    }

    /// Attempts to connect until it succeeds or shutdown is requested.
    async fn establish(
        &self,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<Arc<dyn BrokerConnection>> {
        loop {
            if *stop.borrow() {
                return None;
            }

            let attempt = tokio::select! {
                res = self.connector.connect() => res,
                _ = stop.wait_for(|stop| *stop) => return None,
            };

            match attempt {
                Ok(conn) => return Some(conn),
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        retry_in_ms = self.backoff.interval().as_millis() as u64,
                        "failure to connect"
                    );

                    if !self.backoff.wait(stop).await {
                        return None;
                    }
                }
            }
        }
    }
}
