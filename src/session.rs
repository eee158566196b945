// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Session Establishment
//!
//! This module owns the procedure that turns configuration into a live
//! consuming session: open a connection, open a channel on it, declare the
//! exchange and queue, bind them with the wildcard key, and start consuming
//! with explicit acknowledgement. The same procedure serves the initial
//! activation and every reconnection attempt. A lighter variant reuses an
//! existing connection for channel-level recovery.

use crate::client::{BrokerChannel, BrokerClient, BrokerConnection, DeliverySink};
use crate::errors::AmqpError;
use crate::topology::{ConsumeTopology, BINDING_KEY_ALL};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A live consuming session: connection, channel and consumer tag.
///
/// Owned exclusively by the connector; destroyed on `close()` or superseded
/// by a new session on reconnection.
pub(crate) struct Session {
    pub(crate) connection: Arc<dyn BrokerConnection>,
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) consumer_tag: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("consumer_tag", &self.consumer_tag)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Tears the session down: cancel the consumer, close the channel, close
    /// the connection. Each step is best-effort; shutdown must be
    /// unconditionally effective, so individual failures are logged and
    /// swallowed.
    pub(crate) async fn release(self) {
        if let Err(err) = self.channel.cancel(&self.consumer_tag).await {
            debug!(error = err.to_string(), "error cancelling consumer");
        }
        if let Err(err) = self.channel.close().await {
            debug!(error = err.to_string(), "error closing channel");
        }
        if let Err(err) = self.connection.close().await {
            debug!(error = err.to_string(), "error closing connection");
        }
    }
}

/// Opens a connection and builds a full session on it.
///
/// On failure at any step after the connection opened, the partial
/// connection is closed before the error propagates; no sockets survive a
/// failed establishment.
pub(crate) async fn establish(
    client: &dyn BrokerClient,
    uri: &str,
    topology: &ConsumeTopology,
    sink: DeliverySink,
) -> Result<Session, AmqpError> {
    let connection = client.connect(uri).await?;

    match establish_channel_only(connection.as_ref(), topology, sink).await {
        Ok((channel, consumer_tag)) => Ok(Session {
            connection,
            channel,
            consumer_tag,
        }),
        Err(err) => {
            if let Err(close_err) = connection.close().await {
                debug!(
                    error = close_err.to_string(),
                    "error closing partial connection"
                );
            }
            Err(err)
        }
    }
}

/// Builds a channel, topology and consumer on an existing connection.
///
/// Used for channel-level recovery; never opens a new connection. On failure
/// after the channel opened, the partial channel is closed before the error
/// propagates.
pub(crate) async fn establish_channel_only(
    connection: &dyn BrokerConnection,
    topology: &ConsumeTopology,
    sink: DeliverySink,
) -> Result<(Arc<dyn BrokerChannel>, String), AmqpError> {
    let channel = connection.create_channel().await?;

    match install_topology(channel.as_ref(), topology, sink).await {
        Ok(consumer_tag) => Ok((channel, consumer_tag)),
        Err(err) => {
            if let Err(close_err) = channel.close().await {
                debug!(
                    error = close_err.to_string(),
                    "error closing partial channel"
                );
            }
            Err(err)
        }
    }
}

async fn install_topology(
    channel: &dyn BrokerChannel,
    topology: &ConsumeTopology,
    sink: DeliverySink,
) -> Result<String, AmqpError> {
    channel
        .declare_exchange(&topology.exchange, &topology.exchange_opts)
        .await?;
    channel
        .declare_queue(&topology.queue, &topology.queue_opts)
        .await?;
    channel
        .bind_queue(&topology.queue, &topology.exchange, BINDING_KEY_ALL)
        .await?;

    let tag = format!("ctag-{}", Uuid::new_v4());
    channel.consume(&topology.queue, &tag, sink).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockBrokerChannel, MockBrokerClient, MockBrokerConnection};
    use futures_util::FutureExt;

    fn noop_sink() -> DeliverySink {
        Arc::new(|_| async {}.boxed())
    }

    fn topology() -> ConsumeTopology {
        ConsumeTopology::new("events", "orders")
    }

    #[tokio::test]
    async fn establishes_full_session() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_exchange()
            .times(1)
            .returning(|_, _| Ok(()));
        channel
            .expect_declare_queue()
            .times(1)
            .returning(|_, _| Ok(()));
        channel
            .expect_bind_queue()
            .withf(|queue, exchange, key| queue == "orders" && exchange == "events" && key == "#")
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_consume()
            .times(1)
            .returning(|_, tag, _| Ok(tag.to_owned()));

        let mut connection = MockBrokerConnection::new();
        let channel = Arc::new(channel);
        connection
            .expect_create_channel()
            .times(1)
            .return_once(move || Ok(channel));
        connection.expect_close().times(0);

        let mut client = MockBrokerClient::new();
        let connection = Arc::new(connection);
        client
            .expect_connect()
            .times(1)
            .return_once(move |_| Ok(connection));

        let session = establish(&client, "amqp://localhost", &topology(), noop_sink())
            .await
            .unwrap();
        assert!(session.consumer_tag.starts_with("ctag-"));
    }

    #[tokio::test]
    async fn closes_partial_connection_when_topology_fails() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_exchange()
            .times(1)
            .returning(|name, _| Err(AmqpError::DeclareExchangeError(name.to_owned())));
        channel.expect_close().times(1).returning(|| Ok(()));

        let mut connection = MockBrokerConnection::new();
        let channel = Arc::new(channel);
        connection
            .expect_create_channel()
            .times(1)
            .return_once(move || Ok(channel));
        connection.expect_close().times(1).returning(|| Ok(()));

        let mut client = MockBrokerClient::new();
        let connection = Arc::new(connection);
        client
            .expect_connect()
            .times(1)
            .return_once(move |_| Ok(connection));

        let err = establish(&client, "amqp://localhost", &topology(), noop_sink())
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::DeclareExchangeError("events".to_owned()));
    }

    #[tokio::test]
    async fn channel_only_never_opens_a_connection() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_exchange()
            .times(1)
            .returning(|_, _| Ok(()));
        channel
            .expect_declare_queue()
            .times(1)
            .returning(|_, _| Ok(()));
        channel
            .expect_bind_queue()
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_consume()
            .times(1)
            .returning(|_, tag, _| Ok(tag.to_owned()));

        let mut connection = MockBrokerConnection::new();
        let channel = Arc::new(channel);
        connection
            .expect_create_channel()
            .times(1)
            .return_once(move || Ok(channel));

        let (_, tag) = establish_channel_only(&connection, &topology(), noop_sink())
            .await
            .unwrap();
        assert!(tag.starts_with("ctag-"));
    }
}
