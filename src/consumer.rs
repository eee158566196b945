// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! This module implements the per-message delivery handling: a trace span is
//! created from the message headers, the user handler is invoked, and the
//! message is acknowledged or rejected based on the outcome. Failed messages
//! are rejected without requeue; poison messages must not cycle through the
//! queue forever.

use crate::client::{BrokerChannel, Delivery};
use crate::errors::AmqpError;
use crate::handler::{ConsumerHandler, ConsumerMessage};
use crate::otel;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// Processes a single delivery on the active channel.
///
/// A handler that completes causes exactly one `ack`; a handler that fails
/// causes exactly one `nack` with `requeue = false` and `multiple = false`.
/// Handler failures never propagate; ack/nack transport failures do, so the
/// caller can log them.
pub(crate) async fn handle_delivery(
    tracer: &BoxedTracer,
    queue: &str,
    handler: &dyn ConsumerHandler,
    channel: Arc<dyn BrokerChannel>,
    delivery: &Delivery,
) -> Result<(), AmqpError> {
    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, &delivery.routing_key);

    debug!(
        "received message from exchange: {} with key: {}",
        delivery.exchange, delivery.routing_key
    );

    let msg = ConsumerMessage::from_delivery(queue, delivery);

    match handler.exec(&ctx, &msg, channel.as_ref()).await {
        Ok(_) => {
            debug!("message successfully processed");
            match channel.ack(delivery.delivery_tag).await {
                Err(err) => {
                    error!("error whiling ack msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(AmqpError::AckMessageError)
                }
                _ => {
                    span.set_status(Status::Ok);
                    Ok(())
                }
            }
        }
        Err(err) => {
            warn!(error = err.to_string(), "handler failure, rejecting msg");
            span.record_error(&err);

            match channel.nack(delivery.delivery_tag, false, false).await {
                Err(err) => {
                    error!("error whiling nack msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to nack msg"),
                    });
                    Err(AmqpError::NackMessageError)
                }
                _ => {
                    span.set_status(Status::Error {
                        description: Cow::from("msg rejected"),
                    });
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockBrokerChannel;
    use crate::errors::HandlerError;
    use async_trait::async_trait;
    use opentelemetry::Context;
    use std::collections::BTreeMap;

    struct OkHandler;

    #[async_trait]
    impl ConsumerHandler for OkHandler {
        async fn exec(
            &self,
            _ctx: &Context,
            _msg: &ConsumerMessage,
            _channel: &dyn BrokerChannel,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl ConsumerHandler for FailingHandler {
        async fn exec(
            &self,
            _ctx: &Context,
            _msg: &ConsumerMessage,
            _channel: &dyn BrokerChannel,
        ) -> Result<(), HandlerError> {
            Err("boom".into())
        }
    }

    fn delivery() -> Delivery {
        Delivery {
            delivery_tag: 7,
            exchange: "events".to_owned(),
            routing_key: "orders.created".to_owned(),
            redelivered: false,
            headers: BTreeMap::new(),
            data: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn acks_exactly_once_when_handler_succeeds() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_ack()
            .withf(|tag| *tag == 7)
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_nack().times(0);

        let tracer = opentelemetry::global::tracer("test");
        handle_delivery(
            &tracer,
            "orders",
            &OkHandler,
            Arc::new(channel),
            &delivery(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn nacks_without_requeue_when_handler_fails() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_ack().times(0);
        channel
            .expect_nack()
            .withf(|tag, requeue, multiple| *tag == 7 && !requeue && !multiple)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let tracer = opentelemetry::global::tracer("test");
        handle_delivery(
            &tracer,
            "orders",
            &FailingHandler,
            Arc::new(channel),
            &delivery(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn surfaces_ack_failure() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_ack()
            .times(1)
            .returning(|_| Err(AmqpError::AckMessageError));

        let tracer = opentelemetry::global::tracer("test");
        let err = handle_delivery(
            &tracer,
            "orders",
            &OkHandler,
            Arc::new(channel),
            &delivery(),
        )
        .await
        .unwrap_err();
        assert_eq!(err, AmqpError::AckMessageError);
    }
}
