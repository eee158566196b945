// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient Connector Lifecycle
//!
//! This module owns the lifecycle of the consuming session: building the
//! connector from configuration, activating it, delivering failures to the
//! recovery scheduler, and tearing everything down on close.
//!
//! The connector is a small state machine over {Disconnected, Connected,
//! Reconnecting}. Races between `connect()`, `close()`, in-flight recovery
//! attempts and failure callbacks are resolved with three pieces of shared
//! state: an intent flag set by `close()`, an epoch counter bumped by every
//! `connect()` and `close()`, and the abort handle of the pending retry
//! timer. Every asynchronous continuation captures the epoch it was started
//! under and becomes a no-op once it no longer matches.

use crate::amqp::LapinBroker;
use crate::client::{BrokerChannel, BrokerClient, Delivery, DeliverySink};
use crate::config::ConnectionConfig;
use crate::consumer;
use crate::errors::AmqpError;
use crate::handler::ConsumerHandler;
use crate::policy::ReconnectionPolicy;
use crate::session::{establish, establish_channel_only, Session};
use crate::topology::{ConsumeTopology, ExchangeOptions, QueueOptions};
use futures_util::FutureExt;
use opentelemetry::global;
use std::sync::{Arc, Mutex, Weak};
use tokio::{runtime::Handle, task::AbortHandle};
use tracing::{debug, error, info, warn};

/// Connection state of a [`Connector`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectorState {
    /// No session. Initial state, and the terminal state of every failure
    /// path once recovery is exhausted or disabled.
    #[default]
    Disconnected,
    /// A session is installed and consuming.
    Connected,
    /// The session was lost and a reconnection attempt is pending.
    Reconnecting,
}

/// Builder accumulating the connector configuration.
///
/// All setters are optional until [`build`](ConnectorBuilder::build), which
/// fails fast on missing topology or handler. Validation has no side effects
/// and never touches the network.
#[derive(Default)]
pub struct ConnectorBuilder {
    uri: Option<String>,
    exchange: Option<String>,
    exchange_opts: ExchangeOptions,
    queue: Option<String>,
    queue_opts: QueueOptions,
    handler: Option<Arc<dyn ConsumerHandler>>,
    policy: ReconnectionPolicy,
    client: Option<Arc<dyn BrokerClient>>,
}

impl ConnectorBuilder {
    pub fn new() -> ConnectorBuilder {
        ConnectorBuilder::default()
    }

    /// Sets the connection target from a raw AMQP URI.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn url(mut self, uri: &str) -> Self {
        self.uri = Some(uri.to_owned());
        self
    }

    /// Sets the connection target from a structured configuration.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn config(mut self, cfg: &ConnectionConfig) -> Self {
        self.uri = Some(cfg.to_uri());
        self
    }

    /// Sets the exchange the session declares and binds to.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, name: &str) -> Self {
        self.exchange = Some(name.to_owned());
        self
    }

    /// Overrides the exchange declaration options.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange_options(mut self, opts: ExchangeOptions) -> Self {
        self.exchange_opts = opts;
        self
    }

    /// Sets the queue the session declares and consumes from.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue(mut self, name: &str) -> Self {
        self.queue = Some(name.to_owned());
        self
    }

    /// Overrides the queue declaration options.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue_options(mut self, opts: QueueOptions) -> Self {
        self.queue_opts = opts;
        self
    }

    /// Sets the handler invoked for every delivered message.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn handler(mut self, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Sets the reconnection policy.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn reconnection(mut self, policy: ReconnectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the broker client. Defaults to the lapin-backed client.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn client(mut self, client: Arc<dyn BrokerClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Validates the configuration and builds the connector.
    ///
    /// # Returns
    /// The connector, or a configuration error when the exchange, queue or
    /// handler is missing. No network call is made.
    pub fn build(self) -> Result<Connector, AmqpError> {
        let exchange = match self.exchange {
            Some(name) if !name.is_empty() => name,
            _ => return Err(AmqpError::ExchangeNotSpecified),
        };
        let queue = match self.queue {
            Some(name) if !name.is_empty() => name,
            _ => return Err(AmqpError::QueueNotSpecified),
        };
        let handler = self.handler.ok_or(AmqpError::HandlerNotProvided)?;

        let uri = self
            .uri
            .unwrap_or_else(|| ConnectionConfig::default().to_uri());
        let client = self
            .client
            .unwrap_or_else(|| Arc::new(LapinBroker::new()));

        Ok(Connector {
            inner: Arc::new(Inner {
                client,
                uri,
                topology: ConsumeTopology {
                    exchange,
                    exchange_opts: self.exchange_opts,
                    queue,
                    queue_opts: self.queue_opts,
                },
                handler,
                policy: self.policy,
                shared: Mutex::new(Shared::default()),
            }),
        })
    }
}

/// A resilient, self-recovering consumer connection to RabbitMQ.
pub struct Connector {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Inner {
    client: Arc<dyn BrokerClient>,
    uri: String,
    topology: ConsumeTopology,
    handler: Arc<dyn ConsumerHandler>,
    policy: ReconnectionPolicy,
    shared: Mutex<Shared>,
}

#[derive(Default)]
struct Shared {
    state: ConnectorState,
    session: Option<Session>,
    /// Intent flag: set by `close()` before teardown, consulted by every
    /// asynchronous continuation.
    closing: bool,
    /// Failed reconnection attempts since the last successful establishment.
    attempts: u32,
    /// Generation counter bumped by every `connect()` and `close()`.
    epoch: u64,
    /// Discriminates the delivery sink of the currently installed channel
    /// from the sinks of superseded channels.
    sink_serial: u64,
    /// Abort handle of the pending retry timer, present iff Reconnecting.
    retry_timer: Option<AbortHandle>,
}

impl Connector {
    pub fn builder() -> ConnectorBuilder {
        ConnectorBuilder::new()
    }

    /// Activates the connector: establishes a session and starts consuming.
    ///
    /// Authoritative over any recovery in flight: a pending reconnection
    /// timer is cancelled and a stale attempt's eventual effect discarded.
    /// On failure the connector is left Disconnected with all partial
    /// resources released, and the error is returned.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        let epoch = {
            let mut sh = self.inner.shared.lock().unwrap();
            sh.closing = false;
            sh.epoch += 1;
            sh.attempts = 0;
            if let Some(timer) = sh.retry_timer.take() {
                timer.abort();
            }
            if sh.state == ConnectorState::Reconnecting {
                sh.state = ConnectorState::Disconnected;
            }
            sh.epoch
        };

        // a fresh connect supersedes whatever session is still installed
        let stale = self.inner.shared.lock().unwrap().session.take();
        if let Some(session) = stale {
            session.release().await;
        }

        let sink = self.inner.delivery_sink();
        match establish(
            self.inner.client.as_ref(),
            &self.inner.uri,
            &self.inner.topology,
            sink,
        )
        .await
        {
            Ok(session) => {
                self.inner.install(session, epoch).await;
                Ok(())
            }
            Err(err) => {
                let mut sh = self.inner.shared.lock().unwrap();
                if sh.epoch == epoch {
                    sh.state = ConnectorState::Disconnected;
                }
                Err(err)
            }
        }
    }

    /// Shuts the connector down: cancels any pending recovery and releases
    /// the session. Safe to call from any state, including while a
    /// `connect()` or reconnection attempt is in flight, and idempotent.
    /// Individual close failures are swallowed; shutdown is unconditionally
    /// effective.
    pub async fn close(&self) {
        let session = {
            let mut sh = self.inner.shared.lock().unwrap();
            sh.closing = true;
            sh.epoch += 1;
            if let Some(timer) = sh.retry_timer.take() {
                timer.abort();
            }
            sh.state = ConnectorState::Disconnected;
            sh.session.take()
        };

        if let Some(session) = session {
            info!("closing amqp session");
            session.release().await;
        }
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectorState {
        self.inner.shared.lock().unwrap().state
    }

    /// Whether a session is currently installed and consuming.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectorState::Connected
    }

    /// Read-only accessor for the active channel, if any.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.inner
            .shared
            .lock()
            .unwrap()
            .session
            .as_ref()
            .map(|session| Arc::clone(&session.channel))
    }
}

impl Inner {
    /// Installs an established session and wires its failure callbacks,
    /// unless a `close()` or a newer `connect()` won the race in the
    /// meantime, in which case the session is released instead.
    async fn install(self: &Arc<Self>, session: Session, epoch: u64) {
        self.wire_connection(&session, epoch);
        self.wire_channel(&session.channel, epoch);

        let superseded = {
            let mut sh = self.shared.lock().unwrap();
            if sh.closing || sh.epoch != epoch {
                Some(session)
            } else {
                sh.session = Some(session);
                sh.state = ConnectorState::Connected;
                sh.attempts = 0;
                sh.retry_timer = None;
                None
            }
        };

        match superseded {
            Some(session) => {
                debug!("session superseded before install, releasing");
                session.release().await;
            }
            None => info!("amqp session established"),
        }
    }

    fn wire_connection(self: &Arc<Self>, session: &Session, epoch: u64) {
        let weak = Arc::downgrade(self);
        let rt = Handle::current();
        session.connection.on_close(Box::new(move |err| {
            if let Some(inner) = weak.upgrade() {
                rt.spawn(inner.handle_connection_failure(epoch, err));
            }
        }));
    }

    fn wire_channel(self: &Arc<Self>, channel: &Arc<dyn BrokerChannel>, epoch: u64) {
        let weak = Arc::downgrade(self);
        let rt = Handle::current();
        channel.on_close(Box::new(move |err| {
            if let Some(inner) = weak.upgrade() {
                rt.spawn(inner.handle_channel_failure(epoch, err));
            }
        }));
    }

    /// Reacts to an unexpected connection loss: releases the stale session
    /// and hands off to the recovery scheduler, or stops at Disconnected
    /// when reconnection is disabled.
    async fn handle_connection_failure(self: Arc<Self>, epoch: u64, err: AmqpError) {
        let (stale, reconnect) = {
            let mut sh = self.shared.lock().unwrap();
            if sh.closing || sh.epoch != epoch {
                return;
            }
            // only the Connected state hands off to the scheduler; a second
            // failure event while recovery is already in progress is stale
            if sh.state != ConnectorState::Connected {
                return;
            }
            error!(error = err.to_string(), "amqp connection lost");

            let stale = sh.session.take();
            if self.policy.is_enabled() {
                sh.state = ConnectorState::Reconnecting;
                (stale, true)
            } else {
                sh.state = ConnectorState::Disconnected;
                (stale, false)
            }
        };

        if let Some(session) = stale {
            session.release().await;
        }
        if reconnect {
            self.schedule_reconnect(epoch);
        }
    }

    /// Reacts to an unexpected channel loss while the connection survives:
    /// recreates the channel and topology in place, escalating to a full
    /// reconnection when the recreation itself fails.
    async fn handle_channel_failure(self: Arc<Self>, epoch: u64, err: AmqpError) {
        let connection = {
            let sh = self.shared.lock().unwrap();
            if sh.closing || sh.epoch != epoch {
                return;
            }
            match sh.session.as_ref() {
                Some(session) => Arc::clone(&session.connection),
                None => return,
            }
        };
        warn!(error = err.to_string(), "amqp channel lost, recreating");

        let sink = self.delivery_sink();
        match establish_channel_only(connection.as_ref(), &self.topology, sink).await {
            Ok((channel, consumer_tag)) => {
                self.wire_channel(&channel, epoch);

                let superseded = {
                    let mut sh = self.shared.lock().unwrap();
                    if sh.closing || sh.epoch != epoch {
                        true
                    } else if let Some(session) = sh.session.as_mut() {
                        session.channel = Arc::clone(&channel);
                        session.consumer_tag = consumer_tag;
                        false
                    } else {
                        true
                    }
                };

                if superseded {
                    debug!("channel recreation superseded, releasing replacement");
                    if let Err(close_err) = channel.close().await {
                        debug!(
                            error = close_err.to_string(),
                            "error closing replacement channel"
                        );
                    }
                } else {
                    info!("amqp channel recreated");
                }
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    "channel recreation failed, falling back to full reconnection"
                );
                self.handle_connection_failure(epoch, err).await;
            }
        }
    }

    /// Arms the one-shot backoff timer for the next reconnection attempt.
    fn schedule_reconnect(self: &Arc<Self>, epoch: u64) {
        let delay = {
            let sh = self.shared.lock().unwrap();
            if sh.closing || sh.epoch != epoch {
                return;
            }
            self.policy.next_delay(sh.attempts)
        };
        info!(
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnection attempt"
        );

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.try_reconnect(epoch).await;
        });

        let mut sh = self.shared.lock().unwrap();
        if sh.closing || sh.epoch != epoch {
            task.abort();
            return;
        }
        sh.retry_timer = Some(task.abort_handle());
    }

    /// Runs one reconnection attempt: a full session establishment. Resets
    /// the attempt counter on success; on failure schedules the next attempt
    /// or gives up once the retry bound is reached.
    async fn try_reconnect(self: Arc<Self>, epoch: u64) {
        let attempt = {
            let mut sh = self.shared.lock().unwrap();
            if sh.closing || sh.epoch != epoch {
                return;
            }
            sh.retry_timer = None;
            sh.attempts
        };
        info!(attempt = attempt, "attempting to reconnect");

        let sink = self.delivery_sink();
        match establish(self.client.as_ref(), &self.uri, &self.topology, sink).await {
            Ok(session) => self.install(session, epoch).await,
            Err(err) => {
                let exhausted = {
                    let mut sh = self.shared.lock().unwrap();
                    if sh.closing || sh.epoch != epoch {
                        return;
                    }
                    sh.attempts += 1;
                    error!(
                        error = err.to_string(),
                        attempt = sh.attempts,
                        "reconnection attempt failed"
                    );

                    let exhausted =
                        self.policy.max_retries > 0 && sh.attempts >= self.policy.max_retries;
                    if exhausted {
                        sh.state = ConnectorState::Disconnected;
                    }
                    exhausted
                };

                if exhausted {
                    error!("reconnection attempts exhausted, giving up");
                } else {
                    self.schedule_reconnect(epoch);
                }
            }
        }
    }

    /// Builds the delivery callback for a channel about to be established.
    /// The serial allocated here identifies that channel; deliveries arriving
    /// from superseded channels are dropped without touching the handler.
    fn delivery_sink(self: &Arc<Self>) -> DeliverySink {
        let serial = {
            let mut sh = self.shared.lock().unwrap();
            sh.sink_serial += 1;
            sh.sink_serial
        };

        let weak = Arc::downgrade(self);
        Arc::new(move |delivery| {
            let weak: Weak<Inner> = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(serial, delivery).await;
                }
            }
            .boxed()
        })
    }

    /// Routes one delivery to the handler via the consumption adapter.
    async fn dispatch(self: Arc<Self>, serial: u64, delivery: Option<Delivery>) {
        let Some(delivery) = delivery else {
            debug!("consumer cancelled by the broker, ignoring");
            return;
        };

        let channel = {
            let sh = self.shared.lock().unwrap();
            if sh.closing || sh.sink_serial != serial {
                None
            } else {
                sh.session.as_ref().map(|s| Arc::clone(&s.channel))
            }
        };
        let Some(channel) = channel else {
            debug!("dropping delivery received on a torn-down channel");
            return;
        };

        if let Err(err) = consumer::handle_delivery(
            &global::tracer("amqp consumer"),
            &self.topology.queue,
            self.handler.as_ref(),
            channel,
            &delivery,
        )
        .await
        {
            error!(error = err.to_string(), "error consume msg");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HandlerError;
    use crate::handler::ConsumerMessage;
    use async_trait::async_trait;
    use opentelemetry::Context;

    struct NoopHandler;

    #[async_trait]
    impl ConsumerHandler for NoopHandler {
        async fn exec(
            &self,
            _ctx: &Context,
            _msg: &ConsumerMessage,
            _channel: &dyn BrokerChannel,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn build_fails_without_exchange() {
        let err = Connector::builder()
            .queue("orders")
            .handler(Arc::new(NoopHandler))
            .build()
            .unwrap_err();
        assert_eq!(err, AmqpError::ExchangeNotSpecified);
        assert!(err.is_configuration());
    }

    #[test]
    fn build_fails_on_empty_exchange_name() {
        let err = Connector::builder()
            .exchange("")
            .queue("orders")
            .handler(Arc::new(NoopHandler))
            .build()
            .unwrap_err();
        assert_eq!(err, AmqpError::ExchangeNotSpecified);
    }

    #[test]
    fn build_fails_without_queue() {
        let err = Connector::builder()
            .exchange("events")
            .handler(Arc::new(NoopHandler))
            .build()
            .unwrap_err();
        assert_eq!(err, AmqpError::QueueNotSpecified);
    }

    #[test]
    fn build_fails_without_handler() {
        let err = Connector::builder()
            .exchange("events")
            .queue("orders")
            .build()
            .unwrap_err();
        assert_eq!(err, AmqpError::HandlerNotProvided);
    }

    #[test]
    fn built_connector_starts_disconnected() {
        let connector = Connector::builder()
            .exchange("events")
            .queue("orders")
            .handler(Arc::new(NoopHandler))
            .build()
            .unwrap();
        assert_eq!(connector.state(), ConnectorState::Disconnected);
        assert!(!connector.is_connected());
        assert!(connector.channel().is_none());
    }
}
