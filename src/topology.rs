// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumption Topology
//!
//! This module defines the topology the connector establishes on every
//! session: a single durable topic exchange, a single durable queue, and a
//! wildcard binding between them. The exchange kind is fixed to topic and the
//! binding key to `#`, so every message published to the exchange is routed
//! to the queue.

/// Wildcard routing key binding the queue to the exchange.
pub const BINDING_KEY_ALL: &str = "#";

/// Declaration options for the exchange.
///
/// Implements the builder pattern. The exchange is durable by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        ExchangeOptions {
            durable: true,
            auto_delete: false,
            internal: false,
            passive: false,
            no_wait: false,
        }
    }
}

impl ExchangeOptions {
    /// Creates options with default settings (durable).
    pub fn new() -> ExchangeOptions {
        ExchangeOptions::default()
    }

    /// Makes the exchange transient, dropped on broker restart.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Marks the exchange internal, unavailable to publishers.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Declares passively, failing when the exchange does not already exist.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }
}

/// Declaration options for the queue.
///
/// Implements the builder pattern. The queue is durable by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            durable: true,
            exclusive: false,
            auto_delete: false,
            passive: false,
            no_wait: false,
        }
    }
}

impl QueueOptions {
    /// Creates options with default settings (durable).
    pub fn new() -> QueueOptions {
        QueueOptions::default()
    }

    /// Makes the queue transient, dropped on broker restart.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Declares passively, failing when the queue does not already exist.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }
}

/// The exchange/queue/binding triple a session declares before consuming.
#[derive(Debug, Clone)]
pub struct ConsumeTopology {
    pub(crate) exchange: String,
    pub(crate) exchange_opts: ExchangeOptions,
    pub(crate) queue: String,
    pub(crate) queue_opts: QueueOptions,
}

impl ConsumeTopology {
    pub fn new(exchange: &str, queue: &str) -> ConsumeTopology {
        ConsumeTopology {
            exchange: exchange.to_owned(),
            exchange_opts: ExchangeOptions::default(),
            queue: queue.to_owned(),
            queue_opts: QueueOptions::default(),
        }
    }

    /// The exchange name messages are published to.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The queue name the connector consumes from.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}
