// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Abstraction
//!
//! This module defines the traits the connector consumes from the broker
//! client: opening connections, opening channels, declaring topology,
//! consuming, and acknowledging messages. The lifecycle and recovery logic is
//! written entirely against these traits, so faults can be injected at this
//! boundary in tests without a live broker. The production implementation
//! lives in [`crate::amqp`].

use crate::errors::AmqpError;
use crate::topology::{ExchangeOptions, QueueOptions};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::{collections::BTreeMap, sync::Arc};

/// A message delivered by the broker, decoupled from the wire library.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or nack this delivery.
    pub delivery_tag: u64,
    /// The exchange the message was published to.
    pub exchange: String,
    /// The routing key the message was published with.
    pub routing_key: String,
    /// Whether the broker flagged this delivery as redelivered.
    pub redelivered: bool,
    /// String-valued headers (trace context travels here).
    pub headers: BTreeMap<String, String>,
    /// The raw payload.
    pub data: Vec<u8>,
}

/// Callback invoked for every delivery on a consumer.
///
/// `None` is the broker's consumer-cancellation sentinel: the consumer was
/// cancelled server-side and no further deliveries will arrive.
pub type DeliverySink = Arc<dyn Fn(Option<Delivery>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback fired when a connection or channel closes unexpectedly.
pub type CloseHandler = Box<dyn Fn(AmqpError) + Send + Sync>;

/// Entry point to the broker: opens connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Opens a connection to the broker at the given AMQP URI.
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live transport-level session to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new channel multiplexed on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Registers the callback fired on unexpected connection failure.
    /// At most one handler is active per connection; registering again
    /// replaces it.
    fn on_close(&self, handler: CloseHandler);

    /// Closes the connection.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel: the unit of topology operations and message flow.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a topic exchange with the given options.
    async fn declare_exchange(
        &self,
        name: &str,
        opts: &ExchangeOptions,
    ) -> Result<(), AmqpError>;

    /// Declares a queue with the given options.
    async fn declare_queue(&self, name: &str, opts: &QueueOptions) -> Result<(), AmqpError>;

    /// Binds a queue to an exchange with the given routing key.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Starts consuming from the queue with explicit acknowledgement mode,
    /// feeding every delivery into `sink`. Returns the consumer tag.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        sink: DeliverySink,
    ) -> Result<String, AmqpError>;

    /// Acknowledges a single delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Negative-acknowledges a delivery.
    async fn nack(&self, delivery_tag: u64, requeue: bool, multiple: bool)
        -> Result<(), AmqpError>;

    /// Cancels the consumer with the given tag.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Registers the callback fired on unexpected channel failure.
    /// At most one handler is active per channel; registering again
    /// replaces it.
    fn on_close(&self, handler: CloseHandler);

    /// Closes the channel.
    async fn close(&self) -> Result<(), AmqpError>;
}
