// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Test doubles shared by the unit tests.

use crate::{
    channel::{Connector, FailureNotifier, Session},
    consumer::{ConsumerConfig, QosConfig},
    delivery::{Acknowledger, Delivery, DeliveryStream},
    dispatcher::ConsumerHandler,
    errors::AmqpError,
    exchange::ExchangeSpec,
    publisher::ProducerConfig,
    queue::{BindSpec, QueueInfo, QueueSpec},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use opentelemetry::Context;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Default)]
pub(crate) struct CountingAcker {
    acks: AtomicUsize,
    nacks: AtomicUsize,
}

impl CountingAcker {
    pub(crate) fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub(crate) fn nacks(&self) -> usize {
        self.nacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Acknowledger for CountingAcker {
    async fn ack(&self, _multiple: bool) -> Result<(), AmqpError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, _multiple: bool, _requeue: bool) -> Result<(), AmqpError> {
        self.nacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, _requeue: bool) -> Result<(), AmqpError> {
        self.nacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) fn delivery(tag: u64, payload: &[u8]) -> (Delivery, Arc<CountingAcker>) {
    let acker = Arc::new(CountingAcker::default());
    let delivery = Delivery::new(
        tag,
        "",
        "orders",
        false,
        BasicProperties::default(),
        payload.to_vec(),
        acker.clone(),
    );

    (delivery, acker)
}

/// Records payloads, and acks them when `ack` is set.
pub(crate) struct RecordingHandler {
    ack: bool,
    payloads: Mutex<Vec<Vec<u8>>>,
}

impl RecordingHandler {
    pub(crate) fn new(ack: bool) -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler {
            ack,
            payloads: Mutex::new(vec![]),
        })
    }

    pub(crate) fn handled(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }

    pub(crate) fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConsumerHandler for RecordingHandler {
    async fn handle(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError> {
        self.payloads.lock().unwrap().push(delivery.data.clone());
        if self.ack {
            delivery.ack().await?;
        }
        Ok(())
    }
}

/// In-memory session whose closure and deliveries are driven by the test.
#[derive(Default)]
pub(crate) struct FakeSession {
    notifiers: Mutex<Vec<FailureNotifier>>,
    deliveries: Mutex<Vec<(String, mpsc::UnboundedSender<Result<Delivery, AmqpError>>)>>,
    consumes: AtomicUsize,
    cancelled: Mutex<Vec<String>>,
    closed_on_register: AtomicBool,
    published: Mutex<Vec<(ProducerConfig, Vec<u8>, BasicProperties)>>,
    stall_publish: AtomicBool,
    closed: AtomicBool,
}

impl FakeSession {
    pub(crate) fn consumes(&self) -> usize {
        self.consumes.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub(crate) fn stall_publish(&self) {
        self.stall_publish.store(true, Ordering::SeqCst);
    }

    pub(crate) fn published(&self) -> Vec<(ProducerConfig, Vec<u8>, BasicProperties)> {
        self.published.lock().unwrap().clone()
    }

    /// Feeds a delivery to every open subscription.
    pub(crate) fn deliver(&self, delivery: Delivery) {
        for (_, tx) in self.deliveries.lock().unwrap().iter() {
            let _ = tx.send(Ok(delivery.clone()));
        }
    }

    /// Simulates the broker closing both the connection and the channel.
    pub(crate) fn drop_connection(&self) {
        self.deliveries.lock().unwrap().clear();
        for notifier in self.notifiers.lock().unwrap().iter() {
            notifier.notify(AmqpError::ConnectionClosed("CONNECTION_FORCED".to_owned()));
            notifier.notify(AmqpError::ChannelClosed("CONNECTION_FORCED".to_owned()));
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueInfo, AmqpError> {
        Ok(QueueInfo {
            name: spec.name.clone(),
            ..Default::default()
        })
    }

    async fn queue_bind(
        &self,
        _queue: &str,
        _bind: &BindSpec,
        _no_wait: bool,
    ) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn exchange_declare(&self, _spec: &ExchangeSpec) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn basic_qos(&self, _qos: &QosConfig) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn basic_consume(&self, cfg: &ConsumerConfig) -> Result<DeliveryStream, AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.deliveries
            .lock()
            .unwrap()
            .push((cfg.consumer_tag.clone(), tx));
        self.consumes.fetch_add(1, Ordering::SeqCst);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ConsumerError("channel closed".to_owned()));
        }

        self.deliveries
            .lock()
            .unwrap()
            .retain(|(tag, _)| tag != consumer_tag);
        self.cancelled.lock().unwrap().push(consumer_tag.to_owned());
        Ok(())
    }

    async fn basic_publish(
        &self,
        cfg: &ProducerConfig,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        if self.stall_publish.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        self.published
            .lock()
            .unwrap()
            .push((cfg.clone(), payload.to_vec(), properties));
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        self.deliveries.lock().unwrap().clear();
        Ok(())
    }

    fn on_failure(&self, notifier: FailureNotifier) {
        if self.closed_on_register.load(Ordering::SeqCst) {
            notifier.notify(AmqpError::ChannelClosed("CONNECTION_FORCED".to_owned()));
        }
        self.notifiers.lock().unwrap().push(notifier);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dial {
    Refused,
    /// Opens a session that reports closure as soon as listeners are attached.
    ClosedOnRegister,
}

/// Connector that succeeds unless a failure was scripted for the next dial.
#[derive(Default)]
pub(crate) struct FakeConnector {
    script: Mutex<VecDeque<Dial>>,
    dials: AtomicUsize,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    dial_delay: Mutex<Option<Duration>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<FakeConnector> {
        Arc::new(FakeConnector::default())
    }

    /// Queues `count` failing dials.
    pub(crate) fn fail_next(&self, count: usize) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..count {
            script.push_back(Dial::Refused);
        }
    }

    /// Queues a dial whose session dies before the supervisor can use it.
    pub(crate) fn close_next_on_register(&self) {
        self.script.lock().unwrap().push_back(Dial::ClosedOnRegister);
    }

    pub(crate) fn remaining_failures(&self) -> usize {
        self.script
            .lock()
            .unwrap()
            .iter()
            .filter(|dial| **dial == Dial::Refused)
            .count()
    }

    pub(crate) fn set_dial_delay(&self, delay: Duration) {
        *self.dial_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn session(&self, index: usize) -> Arc<FakeSession> {
        self.sessions.lock().unwrap()[index].clone()
    }

    pub(crate) fn sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn dial(&self, _uri: &str, _connection_name: &str) -> Result<Arc<dyn Session>, AmqpError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let delay = *self.dial_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let dial = self.script.lock().unwrap().pop_front();
        if dial == Some(Dial::Refused) {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let session = Arc::new(FakeSession::default());
        if dial == Some(Dial::ClosedOnRegister) {
            session.closed.store(true, Ordering::SeqCst);
            session.closed_on_register.store(true, Ordering::SeqCst);
        }
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

/// Polls `cond` in virtual time until it holds.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..20_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}
