// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! Publishes a message on the shared session. There is no buffering or retry:
//! a failure is returned to the caller, who decides whether to try again once
//! the supervisor has reconnected. OpenTelemetry context is propagated in the
//! message headers.

use crate::{channel::Session, errors::AmqpError, otel};
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Where and how to publish. Reusable across calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerConfig {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
}

impl ProducerConfig {
    /// Creates a producer configuration.
    ///
    /// # Parameters
    /// * `exchange` - Exchange to publish to, empty for the default exchange
    /// * `routing_key` - Routing key of every message
    ///
    /// # Returns
    /// A non-mandatory, non-immediate configuration
    pub fn new(exchange: &str, routing_key: &str) -> ProducerConfig {
        ProducerConfig {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            ..Default::default()
        }
    }

    /// Publishes through the default exchange straight to `queue`.
    pub fn to_queue(queue: &str) -> ProducerConfig {
        ProducerConfig::new("", queue)
    }

    /// Asks the broker to return messages that cannot be routed.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }
}

/// Typed header values carried by a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    LongUint(u32),
}

impl From<&HeaderValues> for AMQPValue {
    fn from(value: &HeaderValues) -> Self {
        match value {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v.clone())),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(*v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(*v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValues::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(*v)),
        }
    }
}

/// Opaque payload plus its content type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub data: Vec<u8>,
    pub content_type: String,
    /// Published as the AMQP `type` property.
    pub kind: Option<String>,
    pub headers: HashMap<String, HeaderValues>,
}

impl Message {
    /// Creates a message from raw bytes.
    ///
    /// # Parameters
    /// * `data` - The payload
    /// * `content_type` - MIME type published as the `content_type` property
    pub fn new(data: Vec<u8>, content_type: &str) -> Message {
        Message {
            data,
            content_type: content_type.to_owned(),
            ..Default::default()
        }
    }

    /// Serializes `value` as a JSON message.
    ///
    /// # Returns
    /// The message, or `ParsePayloadError` when serialization fails
    pub fn json<T: Serialize>(value: &T) -> Result<Message, AmqpError> {
        let data = serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::ParsePayloadError(err.to_string())
        })?;

        Ok(Message::new(data, JSON_CONTENT_TYPE))
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    /// Adds a typed header.
    ///
    /// # Parameters
    /// * `key` - Header name
    /// * `value` - Header value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn header(mut self, key: &str, value: HeaderValues) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }
}

/// Trace context and optional deadline of one publish call.
#[derive(Debug, Clone, Default)]
pub struct PublishContext {
    pub trace: Context,
    pub deadline: Option<Instant>,
}

impl PublishContext {
    pub fn new(trace: Context) -> PublishContext {
        PublishContext {
            trace,
            deadline: None,
        }
    }

    /// The publish is abandoned once `timeout` has elapsed from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Publishes a message on the shared session.
///
/// # Parameters
/// * `session` - The live session
/// * `ctx` - Trace context injected into the headers, plus an optional deadline
/// * `cfg` - Exchange, routing key and delivery flags
/// * `msg` - Payload and message properties
///
/// # Returns
/// `Ok(())` once the broker client accepted the message,
/// [`AmqpError::PublishCancelled`] when the deadline passes first, or the
/// publishing error.
pub async fn publish(
    session: &dyn Session,
    ctx: &PublishContext,
    cfg: &ProducerConfig,
    msg: &Message,
) -> Result<(), AmqpError> {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    otel::inject(&ctx.trace, &mut headers);

    for (key, value) in &msg.headers {
        headers.insert(ShortString::from(key.clone()), AMQPValue::from(value));
    }

    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(msg.content_type.clone()))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(headers));

    if let Some(kind) = &msg.kind {
        properties = properties.with_type(ShortString::from(kind.clone()));
    }

    debug!(
        exchange = cfg.exchange,
        routing_key = cfg.routing_key,
        "publishing message"
    );

    let publishing = session.basic_publish(cfg, &msg.data, properties);

    let result = match ctx.deadline {
        Some(deadline) => match timeout_at(deadline, publishing).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    exchange = cfg.exchange,
                    routing_key = cfg.routing_key,
                    "publish deadline exceeded"
                );
                return Err(AmqpError::PublishCancelled);
            }
        },
        None => publishing.await,
    };

    if let Err(err) = &result {
        error!(error = err.to_string(), "error publishing message");
    }

    result
}
