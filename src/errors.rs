// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Reliability Layer
//!
//! `AmqpError` covers every failure the connection provider, publisher and
//! consumers can surface to a caller. It is `Clone` so that the outcome of a
//! single dial sequence can be handed to every caller that waited on it.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Dialing the broker failed, carrying the last dial error
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// A connect sequence finished but no open connection is available
    #[error("failed to get a valid connection")]
    ConnectionUnavailable,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The caller's cancellation token fired before the operation finished
    #[error("operation cancelled")]
    Cancelled,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}` with key `{2}`")]
    BindingExchangeToQueueError(String, String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error putting a channel into publisher-confirm mode
    #[error("failure to enable publisher confirms: {0}")]
    ConfirmSelectError(String),

    /// Error serializing an outbound event
    #[error("failure to serialize event: {0}")]
    SerializationError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker answered the publish with a negative confirmation
    #[error("message not acknowledged by server")]
    PublishNotAcknowledged,

    /// No confirmation arrived within the configured timeout
    #[error("publisher confirmation timeout after {0:?}")]
    PublishConfirmTimeout(Duration),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error declaring a consumer
    #[error("consumer declaration error: {0}")]
    ConsumerDeclarationError(String),

    /// A consumption session is already running on this instance
    #[error("consumer is already consuming messages")]
    AlreadyConsuming,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Invalid or unreadable configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Shutdown did not finish within its overall timeout
    #[error("shutdown timed out")]
    ShutdownTimeout,
}
