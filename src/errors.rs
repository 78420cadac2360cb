// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error types shared by the connection supervisor, the
//! channel lifecycle and the producer/consumer roles. Broker-level failures are
//! always recovered locally by reconnecting; the variants exist so each failing
//! step can be logged and matched precisely.

use thiserror::Error;

/// Failure reported by an application message handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid configuration value
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error switching a channel into confirm mode
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// The handle the operation needed is not open anymore
    #[error("channel is not connected")]
    NotConnected,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker answered a publish with a negative confirmation
    #[error("broker nacked the published message")]
    PublishNacked,

    /// Error serializing a message payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error closing a channel or connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// The component was destroyed while the operation was waiting
    #[error("shutting down")]
    ShuttingDown,
}
