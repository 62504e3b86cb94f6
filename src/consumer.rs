// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer Manager
//!
//! Subscribes to a queue and dispatches each delivery to a caller handler on a
//! dedicated task. QoS is applied before subscribing, since most brokers ignore
//! a prefetch change made after the consumer exists. Consumer tags left empty
//! are generated from the application name and keep their base across
//! restarts.
//!
//! Lifecycle of one subscription:
//! `Unsubscribed -> Subscribing -> Delivering -> Closed`. A closed subscription
//! is only brought back by the supervisor after a reconnect.

use crate::{
    channel::Session,
    delivery::DeliveryStream,
    dispatcher::{dispatch, ConsumerHandler},
    errors::AmqpError,
    naming::NameGenerator,
};
use lapin::types::{AMQPValue, ShortString};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Prefetch settings applied on the channel before subscribing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QosConfig {
    pub prefetch_count: u16,
    pub prefetch_size: u32,
    pub global: bool,
}

/// Parameters of one subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerConfig {
    pub queue: String,
    /// Empty means "generate one".
    pub consumer_tag: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
    pub args: BTreeMap<ShortString, AMQPValue>,
    pub qos: Option<QosConfig>,
}

impl ConsumerConfig {
    pub fn new(queue: &str) -> ConsumerConfig {
        ConsumerConfig {
            queue: queue.to_owned(),
            ..Default::default()
        }
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_owned();
        self
    }

    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub fn arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.args.insert(ShortString::from(key), value);
        self
    }

    pub fn qos(mut self, qos: QosConfig) -> Self {
        self.qos = Some(qos);
        self
    }

    /// Shorthand for a per-consumer prefetch count.
    pub fn prefetch(self, count: u16) -> Self {
        self.qos(QosConfig {
            prefetch_count: count,
            prefetch_size: 0,
            global: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unsubscribed,
    Subscribing,
    Delivering,
    Closed,
}

/// Handle of a running subscription.
pub struct Subscription {
    tag: String,
    session: Arc<dyn Session>,
    state: watch::Receiver<ConsumerState>,
    worker: JoinHandle<()>,
}

impl Subscription {
    /// The tag the subscription was registered under.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The session the subscription was registered on.
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Current lifecycle state. An aborted worker reports `Closed`.
    pub fn state(&self) -> ConsumerState {
        if self.worker.is_finished() {
            return ConsumerState::Closed;
        }
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Waits for the delivery stream to close.
    pub async fn join(self) {
        if let Err(err) = self.worker.await {
            if !err.is_cancelled() {
                error!(consumer = self.tag, error = err.to_string(), "consumer task failed");
            }
        }
    }

    /// Cancels the consumer on the broker and waits for the worker to finish
    /// the deliveries it already received.
    ///
    /// # Returns
    /// The broker error when the cancel could not be sent. The worker is
    /// aborted in that case.
    pub async fn cancel(self) -> Result<(), AmqpError> {
        debug!(consumer = self.tag, "cancelling consumer");

        if let Err(err) = self.session.basic_cancel(&self.tag).await {
            warn!(
                consumer = self.tag,
                error = err.to_string(),
                "failure to cancel consumer"
            );
            self.worker.abort();
            return Err(err);
        }

        info!(consumer = self.tag, "consumer cancelled");
        self.join().await;
        Ok(())
    }

    /// Stops the dispatch worker without telling the broker.
    ///
    /// Only meant for subscriptions whose session is already closed; on a live
    /// session use [`Subscription::cancel`].
    pub fn abort(&self) {
        self.worker.abort();
    }
}

/// Registers consumers and runs their dispatch workers.
pub struct ConsumerManager {
    names: NameGenerator,
}

impl ConsumerManager {
    /// `app_name` is the base for generated consumer tags.
    pub fn new(app_name: &str) -> Arc<ConsumerManager> {
        Arc::new(ConsumerManager {
            names: NameGenerator::new(app_name),
        })
    }

    /// Subscribes and spawns the dispatch worker.
    ///
    /// # Parameters
    /// * `session` - Session the consumer is registered on
    /// * `cfg` - Consumer settings; the resolved tag is written back into it
    /// * `handler` - Receives every delivery and owns its acknowledgment
    ///
    /// # Returns
    /// A [`Subscription`] handle. Failures are logged and returned; nothing is
    /// retried here.
    pub async fn consume(
        &self,
        session: Arc<dyn Session>,
        cfg: &mut ConsumerConfig,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription, AmqpError> {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Unsubscribed);

        let deliveries = self.subscribe(session.as_ref(), cfg, &state_tx).await?;

        let tag = cfg.consumer_tag.clone();
        let worker = tokio::spawn(dispatch(tag.clone(), deliveries, handler, state_tx));

        Ok(Subscription {
            tag,
            session,
            state: state_rx,
            worker,
        })
    }

    async fn subscribe(
        &self,
        session: &dyn Session,
        cfg: &mut ConsumerConfig,
        state: &watch::Sender<ConsumerState>,
    ) -> Result<DeliveryStream, AmqpError> {
        state.send_replace(ConsumerState::Subscribing);

        if let Some(qos) = &cfg.qos {
            debug!(
                prefetch_count = qos.prefetch_count,
                global = qos.global,
                "configuring qos"
            );

            if let Err(err) = session.basic_qos(qos).await {
                error!(error = err.to_string(), "failure to configure qos");
                state.send_replace(ConsumerState::Unsubscribed);
                return Err(err);
            }
        }

        cfg.consumer_tag = self.names.next(&cfg.consumer_tag);

        match session.basic_consume(cfg).await {
            Ok(deliveries) => {
                info!(consumer = cfg.consumer_tag, queue = cfg.queue, "consumer registered");
                Ok(deliveries)
            }
            Err(err) => {
                error!(
                    consumer = cfg.consumer_tag,
                    queue = cfg.queue,
                    error = err.to_string(),
                    "failed to register a consumer"
                );
                state.send_replace(ConsumerState::Unsubscribed);
                Err(err)
            }
        }
    }
}
