// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Connector
//!
//! This module provides the error types for connector operations. The
//! `AmqpError` enum covers configuration validation, connection and channel
//! failures, topology declaration and message acknowledgement errors.
//! Handler outcomes are represented separately by `HandlerError` because they
//! are local to a single message and never reach the connector state machine.

use thiserror::Error;

/// Represents errors that can occur during connector operations.
///
/// Configuration variants are raised synchronously by the builder before any
/// network call. Connection, channel and topology variants are raised by the
/// session establisher and drive the recovery scheduler when they occur
/// outside an explicit activation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// No exchange name was configured before building the connector
    #[error("exchange name was not specified")]
    ExchangeNotSpecified,

    /// No queue name was configured before building the connector
    #[error("queue name was not specified")]
    QueueNotSpecified,

    /// No message handler was configured before building the connector
    #[error("message handler was not provided")]
    HandlerNotProvided,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// Error starting a consumer on the given queue
    #[error("failure to start consumer on queue `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,
}

impl AmqpError {
    /// Whether this error is a fail-fast configuration error raised by the
    /// builder, as opposed to a transport or topology failure.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AmqpError::ExchangeNotSpecified
                | AmqpError::QueueNotSpecified
                | AmqpError::HandlerNotProvided
        )
    }
}

/// Failure reported by a user message handler.
///
/// Resolved locally by rejecting the message, never propagated to the
/// connector lifecycle.
#[derive(Error, Debug)]
#[error("handler failure: {0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        HandlerError(msg.to_owned())
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        HandlerError(msg)
    }
}
