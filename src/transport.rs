// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! lapin-backed implementation of the broker seam. This module handles the
//! creation of AMQP connections and channels, and translates lapin's error
//! callbacks into the `closed()` signals the lifecycle tasks wait on.

use crate::{
    broker::{BrokerChannel, BrokerConnection, Connector, DeliveryStream, RawDelivery},
    configs::RabbitMQConfigs,
    errors::AmqpError,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections using the configured URI.
pub struct LapinConnector {
    cfg: RabbitMQConfigs,
}

impl LapinConnector {
    pub fn new(cfg: &RabbitMQConfigs) -> Arc<LapinConnector> {
        Arc::new(LapinConnector { cfg: cfg.clone() })
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!(host = self.cfg.host, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.cfg.app_name.clone()));

        let conn = match Connection::connect(&self.cfg.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        let closed = Arc::new(watch::Sender::new(false));
        let flag = closed.clone();
        // lapin only reports fatal errors here, the connection is gone once it fires.
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            flag.send_replace(true);
        });

        Ok(Arc::new(LapinConnection { conn, closed }))
    }
}

pub struct LapinConnection {
    conn: Connection,
    closed: Arc<watch::Sender<bool>>,
}

impl LapinConnection {
    async fn open_channel(&self) -> Result<Channel, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(c) => {
                debug!(channel = c.id(), "channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = self.open_channel().await?;
        Ok(LapinChannel::new(channel))
    }

    async fn create_confirm_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = LapinChannel::new(self.open_channel().await?);

        let opts = ConfirmSelectOptions::default();
        if let Err(err) = channel.channel.confirm_select(opts).await {
            error!(
                error = err.to_string(),
                "failure to enable publisher confirms"
            );
            let _ = channel.close().await;
            return Err(AmqpError::ConfirmSelectError);
        }

        Ok(channel)
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow() && self.conn.status().connected()
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.send_replace(true);

        if !self.conn.status().connected() {
            return Ok(());
        }

        self.conn.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::CloseError("connection".to_owned())
        })
    }
}

pub struct LapinChannel {
    channel: Channel,
    closed: Arc<watch::Sender<bool>>,
}

impl LapinChannel {
    fn new(channel: Channel) -> Arc<LapinChannel> {
        let closed = Arc::new(watch::Sender::new(false));
        let flag = closed.clone();
        let id = channel.id();

        channel.on_error(move |err| {
            error!(error = err.to_string(), channel = id, "amqp channel error");
            flag.send_replace(true);
        });

        Arc::new(LapinChannel { channel, closed })
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn assert_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if let Some(dlq_name) = def.dlq_name() {
            debug!("asserting dlq: {}", dlq_name);

            if let Err(err) = self
                .channel
                .queue_declare(dlq_name, def.declare_options(), FieldTable::default())
                .await
            {
                error!(error = err.to_string(), "failure to declare dlq");
                return Err(AmqpError::DeclareQueueError(dlq_name.to_owned()));
            }
        }

        debug!("asserting queue: {}", def.name());
        match self
            .channel
            .queue_declare(def.name(), def.declare_options(), def.arguments())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare queue");
                Err(AmqpError::DeclareQueueError(def.name().to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn publish_confirmed(&self, queue: &str, payload: &[u8]) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                BasicProperties::default()
                    .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string())),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError
            })?;

        match confirm.await {
            Ok(Confirmation::Ack(_)) => Ok(()),
            Ok(Confirmation::Nack(_)) => Err(AmqpError::PublishNacked),
            Ok(Confirmation::NotRequested) => {
                error!("publish on a channel without confirms");
                Err(AmqpError::PublishingError)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    "error waiting for publisher confirm"
                );
                Err(AmqpError::PublishingError)
            }
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(RawDelivery {
                    delivery_tag: delivery.delivery_tag,
                    data: delivery.data,
                }),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow() && self.channel.status().connected()
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.send_replace(true);

        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the channel");
                AmqpError::CloseError("channel".to_owned())
            })
    }
}
