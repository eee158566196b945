// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin-backed Broker Client
//!
//! This module implements the broker client abstraction on top of `lapin`.
//! It establishes connections to RabbitMQ, creates channels, declares the
//! consumption topology, and pumps consumer deliveries into the connector's
//! delivery sink. Connection failures surface through `lapin`'s error
//! handler; channel failures surface through the consumer stream.

use crate::client::{
    BrokerChannel, BrokerClient, BrokerConnection, CloseHandler, Delivery, DeliverySink,
};
use crate::errors::AmqpError;
use crate::topology::{ExchangeOptions, QueueOptions};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::constants::REPLY_SUCCESS,
    types::{AMQPValue, FieldTable},
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};
use tracing::{debug, error};

/// Production [`BrokerClient`] backed by `lapin`.
#[derive(Debug, Default)]
pub struct LapinBroker;

impl LapinBroker {
    pub fn new() -> LapinBroker {
        LapinBroker
    }
}

#[async_trait]
impl BrokerClient for LapinBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");

        let conn = match Connection::connect(uri, ConnectionProperties::default()).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { inner: conn }))
    }
}

struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");

        match self.inner.create_channel().await {
            Ok(ch) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel {
                    inner: ch,
                    close_handler: Arc::new(Mutex::new(None)),
                }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    fn on_close(&self, handler: CloseHandler) {
        self.inner.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection failure");
            handler(AmqpError::ConnectionError);
        });
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "connector shutdown")
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "error closing connection");
                AmqpError::ConnectionError
            })
    }
}

struct LapinChannel {
    inner: Channel,
    close_handler: Arc<Mutex<Option<CloseHandler>>>,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, name: &str, opts: &ExchangeOptions) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", name);

        match self
            .inner
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: opts.passive,
                    durable: opts.durable,
                    auto_delete: opts.auto_delete,
                    internal: opts.internal,
                    nowait: opts.no_wait,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => {
                debug!("exchange: {} was created", name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, opts: &QueueOptions) -> Result<(), AmqpError> {
        debug!("creating queue: {}", name);

        match self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: opts.passive,
                    durable: opts.durable,
                    exclusive: opts.exclusive,
                    auto_delete: opts.auto_delete,
                    nowait: opts.no_wait,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => {
                debug!("queue: {} was created", name);
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        match self
            .inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindQueueError(
                    queue.to_owned(),
                    exchange.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        sink: DeliverySink,
    ) -> Result<String, AmqpError> {
        let mut consumer = match self
            .inner
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
                Err(AmqpError::ConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let tag = consumer.tag().to_string();
        let close_handler = Arc::clone(&self.close_handler);

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => sink(Some(convert_delivery(delivery))).await,
                    Err(err) => {
                        error!(error = err.to_string(), "consumer stream failure");
                        if let Some(handler) = close_handler.lock().unwrap().as_ref() {
                            handler(AmqpError::ChannelError);
                        }
                        return;
                    }
                }
            }
            // stream drained: the broker cancelled the consumer
            sink(None).await;
        });

        Ok(tag)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        requeue: bool,
        multiple: bool,
    ) -> Result<(), AmqpError> {
        match self
            .inner
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        match self
            .inner
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
        {
            Err(err) => {
                debug!(error = err.to_string(), "error cancelling consumer");
                Err(AmqpError::ConsumerError(consumer_tag.to_owned()))
            }
            _ => Ok(()),
        }
    }

    fn on_close(&self, handler: CloseHandler) {
        *self.close_handler.lock().unwrap() = Some(handler);
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "connector shutdown")
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "error closing channel");
                AmqpError::ChannelError
            })
    }
}

/// Converts a lapin delivery into the transport-agnostic representation.
/// Only string-valued headers are carried over; trace context travels as
/// long strings.
fn convert_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let mut headers = BTreeMap::new();
    if let Some(table) = delivery.properties.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(value) = value {
                if let Ok(value) = std::str::from_utf8(value.as_bytes()) {
                    headers.insert(key.to_string(), value.to_owned());
                }
            }
        }
    }

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        headers,
        data: delivery.data,
    }
}
