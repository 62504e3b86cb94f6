// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatch
//!
//! The dispatch worker drains a subscription's delivery stream and hands each
//! delivery to the caller's [`ConsumerHandler`] inside a consumer span whose
//! parent context comes from the message headers.

use crate::{
    consumer::ConsumerState,
    delivery::{Delivery, DeliveryStream},
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Caller-supplied delivery processing.
///
/// The handler owns acknowledgment: call [`Delivery::ack`], [`Delivery::nack`]
/// or [`Delivery::reject`] as appropriate. An `Err` is logged and recorded on
/// the span; the delivery is left as the handler left it.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError>;
}

/// Runs until the stream ends, then reports `Closed`.
pub(crate) async fn dispatch(
    tag: String,
    mut deliveries: DeliveryStream,
    handler: Arc<dyn ConsumerHandler>,
    state: watch::Sender<ConsumerState>,
) {
    state.send_replace(ConsumerState::Delivering);
    info!(consumer = tag, "start consumer");

    let tracer = global::tracer("amqp consumer");

    while let Some(result) = deliveries.next().await {
        match result {
            Ok(delivery) => {
                debug!(
                    consumer = tag,
                    exchange = delivery.exchange,
                    routing_key = delivery.routing_key,
                    "received"
                );

                let (ctx, mut span) = otel::new_span(&delivery.properties, &tracer, &tag);

                match handler.handle(&ctx, &delivery).await {
                    Ok(()) => span.set_status(Status::Ok),
                    Err(err) => {
                        error!(consumer = tag, error = err.to_string(), "error handling msg");
                        span.record_error(&err);
                        span.set_status(Status::Error {
                            description: Cow::from(err.to_string()),
                        });
                    }
                }

                span.end();
            }
            Err(err) => error!(consumer = tag, error = err.to_string(), "errors consume msg"),
        }
    }

    state.send_replace(ConsumerState::Closed);
    info!(consumer = tag, "close consumer");
}
