// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Supervisor
//!
//! `AmqpError` covers every failure the supervisor, the topology declarator,
//! the consumer manager and the producer can report. `ConfigsError` covers
//! startup configuration problems, which callers treat as fatal.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants carry the broker client's message as a `String` so the enum stays
/// comparable and cheap to clone across the failure channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// No live connection is available for the requested operation
    #[error("there is no live connection")]
    NotConnected,

    /// Error closing the connection
    #[error("failure to close the connection: {0}")]
    CloseConnectionError(String),

    /// The broker closed the connection
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The broker closed the channel
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`: {1}")]
    BindingConsumerError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos: {0}")]
    QoSDeclarationError(String),

    /// Error reading from a consumer stream
    #[error("failure to consume message: {0}")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The publish deadline passed before the broker accepted the message
    #[error("publish cancelled: deadline exceeded")]
    PublishCancelled,

    /// Error serializing a message payload
    #[error("failure to serialize payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message: {0}")]
    RejectMessageError(String),

    /// The reconnect ceiling was reached; the process cannot continue
    #[error("failure to reconnect after {0} attempts")]
    ReconnectAttemptsExceeded(u32),

    /// A supervising loop is already running for this supervisor
    #[error("supervisor loop already running")]
    SupervisorAlreadyRunning,
}

/// Errors raised while loading the supervisor configuration.
#[derive(Error, Debug)]
pub enum ConfigsError {
    #[error("failure to load configs: {0}")]
    Load(#[from] config::ConfigError),

    /// `SRV_RMQ_URI` is mandatory outside local deployments
    #[error("the variable SRV_RMQ_URI is required for `{0}` deployments")]
    MissingUri(String),
}
