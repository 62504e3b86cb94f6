// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares exchanges, queues and the bindings between them. Declarations are
//! idempotent on the broker side and are never retried here: a failure means a
//! misconfiguration, not a transient fault.
//!
//! Batch operations are best effort. Every item is attempted, errors are
//! collected in order and handed back; callers check the returned list.
//!
//! The main components are:
//! - `Topology` trait: builder-style registration plus `install`
//! - `AmqpTopology`: the implementation over a [`Session`]

use crate::{
    channel::Session,
    errors::AmqpError,
    exchange::ExchangeSpec,
    queue::{QueueInfo, QueueSpec},
};
use async_trait::async_trait;
use tracing::{debug, error};

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange spec to the topology.
    fn exchange(self, spec: &'tp ExchangeSpec) -> Self;

    /// Adds a queue spec, with its bindings, to the topology.
    fn queue(self, spec: &'tp QueueSpec) -> Self;

    /// Declares every exchange, then every queue and its bindings.
    async fn install(&self) -> Vec<AmqpError>;
}

/// Topology declared over one session.
pub struct AmqpTopology<'tp> {
    session: &'tp dyn Session,
    pub(crate) queues: Vec<&'tp QueueSpec>,
    pub(crate) exchanges: Vec<&'tp ExchangeSpec>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(session: &'tp dyn Session) -> AmqpTopology<'tp> {
        AmqpTopology {
            session,
            queues: vec![],
            exchanges: vec![],
        }
    }

    /// Declares a single queue. Its bindings are not created.
    pub async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, AmqpError> {
        debug!("creating queue: {}", spec.name);

        match self.session.queue_declare(spec).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = spec.name,
                    "error to declare the queue"
                );
                Err(err)
            }
            Ok(info) => {
                debug!("queue: {} was created", spec.name);
                Ok(info)
            }
        }
    }

    /// Declares each queue and its bindings.
    ///
    /// Bindings are attempted even when their queue failed to declare.
    pub async fn declare_queues(&self, specs: &[&QueueSpec]) -> Vec<AmqpError> {
        let mut errors = vec![];

        for spec in specs {
            if let Err(err) = self.declare_queue(spec).await {
                errors.push(err);
            }

            for bind in &spec.binds {
                debug!(
                    "binding queue: {} to the exchange: {} with the key: {}",
                    spec.name, bind.exchange, bind.routing_key
                );

                if let Err(err) = self.session.queue_bind(&spec.name, bind, spec.no_wait).await {
                    error!(
                        error = err.to_string(),
                        queue = spec.name,
                        exchange = bind.exchange,
                        "error to bind queue to exchange"
                    );
                    errors.push(err);
                }
            }
        }

        errors
    }

    /// Declares a single exchange.
    pub async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", spec.name);

        match self.session.exchange_declare(spec).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = spec.name,
                    "error to declare the exchange"
                );
                Err(err)
            }
            Ok(()) => {
                debug!("exchange: {} was created", spec.name);
                Ok(())
            }
        }
    }

    pub async fn declare_exchanges(&self, specs: &[&ExchangeSpec]) -> Vec<AmqpError> {
        let mut errors = vec![];

        for spec in specs {
            if let Err(err) = self.declare_exchange(spec).await {
                errors.push(err);
            }
        }

        errors
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, spec: &'tp ExchangeSpec) -> Self {
        self.exchanges.push(spec);
        self
    }

    fn queue(mut self, spec: &'tp QueueSpec) -> Self {
        self.queues.push(spec);
        self
    }

    /// Exchanges go first so that queue bindings can find them.
    async fn install(&self) -> Vec<AmqpError> {
        let mut errors = self.declare_exchanges(&self.exchanges).await;
        errors.extend(self.declare_queues(&self.queues).await);
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::MockSession, queue::BindSpec};
    use mockall::Sequence;

    fn declared(name: &str) -> Result<QueueInfo, AmqpError> {
        Ok(QueueInfo {
            name: name.to_owned(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_one_invalid_queue_does_not_stop_the_batch() {
        let mut session = MockSession::new();
        session
            .expect_queue_declare()
            .withf(|spec| spec.name == "bad")
            .times(1)
            .returning(|spec| {
                Err(AmqpError::DeclareQueueError(
                    spec.name.clone(),
                    "PRECONDITION_FAILED - inequivalent arg 'durable'".to_owned(),
                ))
            });
        session
            .expect_queue_declare()
            .withf(|spec| spec.name != "bad")
            .times(3)
            .returning(|spec| declared(&spec.name));

        let specs = [
            QueueSpec::new("orders"),
            QueueSpec::new("bad"),
            QueueSpec::new("payments"),
            QueueSpec::new("refunds"),
        ];
        let refs = specs.iter().collect::<Vec<_>>();

        let errors = AmqpTopology::new(&session).declare_queues(&refs).await;

        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], AmqpError::DeclareQueueError(name, _) if name == "bad"));
    }

    #[tokio::test]
    async fn test_binds_are_attempted_even_if_queue_fails() {
        let mut session = MockSession::new();
        session.expect_queue_declare().times(1).returning(|spec| {
            Err(AmqpError::DeclareQueueError(
                spec.name.clone(),
                "ACCESS_REFUSED".to_owned(),
            ))
        });
        session
            .expect_queue_bind()
            .times(2)
            .returning(|queue, bind, _| {
                Err(AmqpError::BindingExchangeToQueueError(
                    queue.to_owned(),
                    bind.exchange.clone(),
                    "NOT_FOUND".to_owned(),
                ))
            });

        let spec = QueueSpec::new("orders")
            .bind(BindSpec::new("orders-exchange", "orders.created"))
            .bind(BindSpec::new("orders-exchange", "orders.updated"));

        let errors = AmqpTopology::new(&session).declare_queues(&[&spec]).await;

        assert_eq!(errors.len(), 3);
        assert!(matches!(errors[0], AmqpError::DeclareQueueError(..)));
        assert!(matches!(errors[2], AmqpError::BindingExchangeToQueueError(..)));
    }

    #[tokio::test]
    async fn test_exchange_batch_collects_every_error() {
        let mut session = MockSession::new();
        session.expect_exchange_declare().times(3).returning(|spec| {
            if spec.name == "fine" {
                Ok(())
            } else {
                Err(AmqpError::DeclareExchangeError(
                    spec.name.clone(),
                    "COMMAND_INVALID - unknown exchange type".to_owned(),
                ))
            }
        });

        let specs = [
            ExchangeSpec::new("broken-a"),
            ExchangeSpec::new("fine"),
            ExchangeSpec::new("broken-b"),
        ];
        let refs = specs.iter().collect::<Vec<_>>();

        let errors = AmqpTopology::new(&session).declare_exchanges(&refs).await;

        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn test_install_declares_exchanges_before_queues() {
        let mut session = MockSession::new();
        let mut seq = Sequence::new();

        for name in ["events", "orders-exchange"] {
            session
                .expect_exchange_declare()
                .withf(move |spec| spec.name == name)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }
        session
            .expect_queue_declare()
            .withf(|spec| spec.name == "orders")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|spec| declared(&spec.name));
        session
            .expect_queue_bind()
            .withf(|queue, bind, _| queue.to_string() == "orders" && bind.exchange == "orders-exchange")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        session
            .expect_queue_declare()
            .withf(|spec| spec.name == "audit")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|spec| declared(&spec.name));

        let events = ExchangeSpec::new("events").fanout();
        let orders_exchange = ExchangeSpec::new("orders-exchange").topic().durable();
        let orders = QueueSpec::new("orders")
            .durable()
            .bind(BindSpec::new("orders-exchange", "orders.#"));
        let audit = QueueSpec::new("audit");

        // registration order is deliberately queues first
        let errors = AmqpTopology::new(&session)
            .queue(&orders)
            .queue(&audit)
            .exchange(&events)
            .exchange(&orders_exchange)
            .install()
            .await;

        assert!(errors.is_empty());
    }
}
