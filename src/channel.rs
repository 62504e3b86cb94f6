// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module is the seam between the supervisor and the broker client. A
//! [`Connector`] dials the broker and opens the single channel used for both
//! publishing and consuming; together they form a [`Session`]. The lapin-backed
//! implementations live here as well.

use crate::{
    consumer::{ConsumerConfig, QosConfig},
    delivery::{Delivery, DeliveryStream},
    errors::AmqpError,
    exchange::ExchangeSpec,
    publisher::ProducerConfig,
    queue::{BindSpec, QueueInfo, QueueSpec},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};

/// Reports the closure of a session to the supervisor.
///
/// Clones share one latch, so however many listeners a session registers the
/// supervisor receives at most one signal for it. Firing clears the liveness
/// flag before the signal is sent.
#[derive(Debug, Clone)]
pub struct FailureNotifier {
    fired: Arc<AtomicBool>,
    status: Arc<AtomicBool>,
    failures: UnboundedSender<AmqpError>,
}

impl FailureNotifier {
    pub fn new(status: Arc<AtomicBool>, failures: UnboundedSender<AmqpError>) -> FailureNotifier {
        FailureNotifier {
            fired: Arc::new(AtomicBool::new(false)),
            status,
            failures,
        }
    }

    /// Marks the session as dead and signals the supervisor, once.
    pub fn notify(&self, err: AmqpError) {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!(error = err.to_string(), "failure already reported");
            return;
        }

        self.status.store(false, Ordering::SeqCst);

        if self.failures.send(err).is_err() {
            warn!("failure channel closed, supervisor is gone");
        }
    }

    /// Prevents any later signal, used before an explicit close.
    pub fn disarm(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }

    /// True once the session was reported dead or the notifier was disarmed.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Dials the broker and opens a session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, uri: &str, connection_name: &str) -> Result<Arc<dyn Session>, AmqpError>;
}

/// One connection and its channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send + Sync {
    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueInfo, AmqpError>;

    async fn queue_bind(&self, queue: &str, bind: &BindSpec, no_wait: bool)
        -> Result<(), AmqpError>;

    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), AmqpError>;

    async fn basic_qos(&self, qos: &QosConfig) -> Result<(), AmqpError>;

    async fn basic_consume(&self, cfg: &ConsumerConfig) -> Result<DeliveryStream, AmqpError>;

    /// Stops the broker from delivering to `consumer_tag`.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        cfg: &ProducerConfig,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    /// Registers listeners for broker-initiated closure of the connection and the channel.
    ///
    /// A session that is already closed when this is called fires `notifier`
    /// right away.
    fn on_failure(&self, notifier: FailureNotifier);
}

/// Connector backed by lapin.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn dial(&self, uri: &str, connection_name: &str) -> Result<Arc<dyn Session>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let conn = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinSession {
                    connection: conn,
                    channel,
                }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                if let Err(close_err) = conn.close(200, "channel failure").await {
                    debug!(error = close_err.to_string(), "failure to close connection");
                }
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }
}

/// Session backed by a lapin connection and channel.
pub struct LapinSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl Session for LapinSession {
    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueInfo, AmqpError> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    passive: spec.passive,
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    nowait: spec.no_wait,
                },
                FieldTable::from(spec.args.clone()),
            )
            .await
            .map(QueueInfo::from)
            .map_err(|err| AmqpError::DeclareQueueError(spec.name.clone(), err.to_string()))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        bind: &BindSpec,
        no_wait: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                &bind.exchange,
                &bind.routing_key,
                QueueBindOptions { nowait: no_wait },
                FieldTable::from(bind.args.clone()),
            )
            .await
            .map_err(|err| {
                AmqpError::BindingExchangeToQueueError(
                    queue.to_owned(),
                    bind.exchange.clone(),
                    err.to_string(),
                )
            })
    }

    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &spec.name,
                lapin::ExchangeKind::from(&spec.kind),
                ExchangeDeclareOptions {
                    passive: spec.passive,
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    internal: spec.internal,
                    nowait: spec.no_wait,
                },
                FieldTable::from(spec.args.clone()),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(spec.name.clone(), err.to_string()))
    }

    async fn basic_qos(&self, qos: &QosConfig) -> Result<(), AmqpError> {
        if qos.prefetch_size != 0 {
            warn!(
                prefetch_size = qos.prefetch_size,
                "prefetch size is not supported by the broker client, ignoring it"
            );
        }

        self.channel
            .basic_qos(
                qos.prefetch_count,
                BasicQosOptions {
                    global: qos.global,
                },
            )
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn basic_consume(&self, cfg: &ConsumerConfig) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                &cfg.queue,
                &cfg.consumer_tag,
                BasicConsumeOptions {
                    no_local: cfg.no_local,
                    no_ack: cfg.auto_ack,
                    exclusive: cfg.exclusive,
                    nowait: cfg.no_wait,
                },
                FieldTable::from(cfg.args.clone()),
            )
            .await
            .map_err(|err| {
                AmqpError::BindingConsumerError(cfg.consumer_tag.clone(), err.to_string())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(Delivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }

    async fn basic_publish(
        &self,
        cfg: &ProducerConfig,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_publish(
                &cfg.exchange,
                &cfg.routing_key,
                BasicPublishOptions {
                    mandatory: cfg.mandatory,
                    immediate: cfg.immediate,
                },
                payload,
                properties,
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::PublishingError(err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.connection
            .close(200, "OK")
            .await
            .map_err(|err| AmqpError::CloseConnectionError(err.to_string()))
    }

    fn on_failure(&self, notifier: FailureNotifier) {
        let conn_notifier = notifier.clone();
        self.connection.on_error(move |err| {
            error!(error = err.to_string(), "connection closed");
            conn_notifier.notify(AmqpError::ConnectionClosed(err.to_string()));
        });

        let chan_notifier = notifier.clone();
        self.channel.on_error(move |err| {
            error!(error = err.to_string(), "channel closed");
            chan_notifier.notify(AmqpError::ChannelClosed(err.to_string()));
        });

        // closed before the listeners were in place
        if !self.connection.status().connected() {
            notifier.notify(AmqpError::ConnectionClosed(
                "closed before listeners were registered".to_owned(),
            ));
        } else if !self.channel.status().connected() {
            notifier.notify(AmqpError::ChannelClosed(
                "closed before listeners were registered".to_owned(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_notifier_fires_once_per_session() {
        let status = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let notifier = FailureNotifier::new(status.clone(), tx);
        let other = notifier.clone();

        notifier.notify(AmqpError::ConnectionClosed("gone".to_owned()));
        other.notify(AmqpError::ChannelClosed("gone".to_owned()));

        assert!(!status.load(Ordering::SeqCst));
        assert_eq!(
            rx.try_recv(),
            Ok(AmqpError::ConnectionClosed("gone".to_owned()))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disarmed_notifier_stays_silent() {
        let status = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let notifier = FailureNotifier::new(status.clone(), tx);
        notifier.disarm();
        notifier.notify(AmqpError::ConnectionClosed("gone".to_owned()));

        assert!(status.load(Ordering::SeqCst));
        assert!(notifier.has_fired());
        assert!(rx.try_recv().is_err());
    }
}
