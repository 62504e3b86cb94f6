// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Specifications
//!
//! Declarative descriptions of queues and of their bindings to exchanges.
//! A `QueueSpec` is handed to the declarator and not retained afterwards.

use lapin::types::{AMQPValue, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Built with chained setters:
///
/// ```
/// use rabbitmq_supervisor::queue::{BindSpec, QueueSpec};
///
/// let spec = QueueSpec::new("orders")
///     .durable()
///     .ttl(60_000)
///     .bind(BindSpec::new("orders-exchange", "orders.created"));
/// assert_eq!(spec.binds.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub passive: bool,
    pub no_wait: bool,
    pub args: BTreeMap<ShortString, AMQPValue>,
    pub binds: Vec<BindSpec>,
}

impl QueueSpec {
    /// Creates a new queue definition.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A non-durable, non-exclusive queue definition with no arguments
    pub fn new(name: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Durable queues survive a broker restart.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue once its last consumer goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Exclusive queues are deleted when the connection closes.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Checks for existence without creating the queue.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Adds a single argument to the declaration.
    pub fn arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.args.insert(ShortString::from(key), value);
        self
    }

    /// Sets the message Time-To-Live.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(self, ttl: i32) -> Self {
        self.arg(AMQP_HEADERS_MESSAGE_TTL, AMQPValue::LongInt(LongInt::from(ttl)))
    }

    /// Sets the maximum number of messages the queue can hold.
    ///
    /// # Parameters
    /// * `max` - Maximum number of messages
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length(self, max: i32) -> Self {
        self.arg(AMQP_HEADERS_MAX_LENGTH, AMQPValue::LongInt(LongInt::from(max)))
    }

    /// Sets the maximum size the queue can hold.
    ///
    /// # Parameters
    /// * `max_bytes` - Maximum size in bytes
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length_bytes(self, max_bytes: i32) -> Self {
        self.arg(
            AMQP_HEADERS_MAX_LENGTH_BYTES,
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        )
    }

    /// Routes rejected or expired messages to a dead letter exchange.
    ///
    /// # Parameters
    /// * `exchange` - Exchange receiving the dead-lettered messages
    /// * `routing_key` - Routing key they are republished with
    ///
    /// # Returns
    /// Self for method chaining
    pub fn dead_letter(self, exchange: &str, routing_key: &str) -> Self {
        self.arg(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
            AMQPValue::LongString(LongString::from(exchange)),
        )
        .arg(
            AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
            AMQPValue::LongString(LongString::from(routing_key)),
        )
    }

    /// Adds a binding to be created right after the queue is declared.
    pub fn bind(mut self, bind: BindSpec) -> Self {
        self.binds.push(bind);
        self
    }
}

/// Binds the owning queue to an exchange with a binding key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindSpec {
    pub exchange: String,
    pub routing_key: String,
    pub args: BTreeMap<ShortString, AMQPValue>,
}

impl BindSpec {
    /// Creates a binding without arguments.
    ///
    /// # Parameters
    /// * `exchange` - Source exchange
    /// * `routing_key` - Binding key matched against message routing keys
    pub fn new(exchange: &str, routing_key: &str) -> BindSpec {
        BindSpec {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            args: BTreeMap::default(),
        }
    }

    pub fn arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.args.insert(ShortString::from(key), value);
        self
    }
}

/// Result of a queue declaration as reported by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

impl From<lapin::Queue> for QueueInfo {
    fn from(queue: lapin::Queue) -> Self {
        QueueInfo {
            name: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        }
    }
}
