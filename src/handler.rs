// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handler Interface
//!
//! This module defines the seam between the connector and application code.
//! A `ConsumerHandler` receives every message delivered on the active
//! channel; its outcome decides whether the message is acknowledged or
//! rejected. Handlers also receive the channel capability, allowing them to
//! perform broker operations of their own.

use crate::client::{BrokerChannel, Delivery};
use crate::errors::HandlerError;
use async_trait::async_trait;
use opentelemetry::Context;
use std::collections::BTreeMap;

/// A message handed to a [`ConsumerHandler`].
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    /// The queue the message was consumed from.
    pub queue: String,
    /// The exchange the message was published to.
    pub exchange: String,
    /// The routing key the message was published with.
    pub routing_key: String,
    /// String-valued message headers.
    pub headers: BTreeMap<String, String>,
    /// The raw message payload.
    pub data: Vec<u8>,
}

impl ConsumerMessage {
    pub(crate) fn from_delivery(queue: &str, delivery: &Delivery) -> ConsumerMessage {
        ConsumerMessage {
            queue: queue.to_owned(),
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            headers: delivery.headers.clone(),
            data: delivery.data.clone(),
        }
    }
}

/// Application-level handler invoked for every delivered message.
///
/// A handler returning `Ok` causes the message to be acknowledged; a handler
/// returning `Err` causes a single `nack` without requeue. Handler failures
/// never affect the connector lifecycle.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one message.
    ///
    /// # Parameters
    /// * `ctx` - Trace context extracted from the message headers
    /// * `msg` - The delivered message
    /// * `channel` - The channel the message arrived on
    async fn exec(
        &self,
        ctx: &Context,
        msg: &ConsumerMessage,
        channel: &dyn BrokerChannel,
    ) -> Result<(), HandlerError>;
}
