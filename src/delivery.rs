// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Deliveries
//!
//! A `Delivery` is one message handed to a consumer handler together with its
//! acknowledgment handle. The handler decides whether to ack, nack or reject;
//! nothing in this crate does it on the handler's behalf.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions},
    BasicProperties,
};
use std::{fmt, sync::Arc};

/// Stream of deliveries produced by a consumer subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

pub(crate) struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple })
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::RejectMessageError(err.to_string()))
    }
}

/// One inbound message.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
            properties,
            data,
            acker,
        }
    }

    /// Acknowledges this delivery only.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack(false).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(false, requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(requeue).await
    }

    /// The content type the publisher set, if any.
    pub fn content_type(&self) -> Option<String> {
        self.properties
            .content_type()
            .as_ref()
            .map(|value| value.to_string())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
            acker: Arc::new(LapinAcker(delivery.acker)),
        }
    }
}
