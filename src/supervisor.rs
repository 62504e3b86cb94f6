// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! Owns the single broker session, reports its liveness, and drives the
//! reconnect loop. Callers depend on the [`AmqpBroker`] trait; the
//! [`RabbitMQSupervisor`] is the implementation.
//!
//! Reconnection policy: on a failure signal the loop dials again. A failed dial
//! increments the attempt counter, re-queues the signal and waits a fixed
//! backoff. A successful dial resets the counter and restarts the consumer.
//! Reaching `max_reconnect_times` failed attempts is fatal.

use crate::{
    channel::{Connector, FailureNotifier, LapinConnector, Session},
    configs::RabbitMQConfigs,
    consumer::{ConsumerConfig, ConsumerManager, Subscription},
    dispatcher::ConsumerHandler,
    errors::AmqpError,
    exchange::ExchangeSpec,
    naming::NameGenerator,
    publisher::{self, Message, ProducerConfig, PublishContext},
    queue::{QueueInfo, QueueSpec},
    topology::{AmqpTopology, Topology},
};
use async_trait::async_trait;
use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    Mutex, RwLock,
};
use tracing::{debug, error, info, warn};

/// Everything a caller needs from the broker connection.
#[async_trait]
pub trait AmqpBroker: Send + Sync {
    /// Returns the live session, dialing only when there is none.
    async fn connect(&self) -> Result<Arc<dyn Session>, AmqpError>;

    /// The current session, live or not.
    async fn get_connect(&self) -> Option<Arc<dyn Session>>;

    fn get_connect_status(&self) -> bool;

    async fn close_connection(&self) -> Result<(), AmqpError>;

    async fn simple_queue_declare(&self, spec: &QueueSpec) -> Result<QueueInfo, AmqpError>;

    /// Declares every queue and its bindings; returns all errors.
    async fn complete_queue_declare(&self, specs: &[QueueSpec]) -> Vec<AmqpError>;

    async fn simple_exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), AmqpError>;

    async fn complete_exchange_declare(&self, specs: &[ExchangeSpec]) -> Vec<AmqpError>;

    /// Declares exchanges first, then queues and bindings; returns all errors.
    async fn complete_declare(
        &self,
        queues: &[QueueSpec],
        exchanges: &[ExchangeSpec],
    ) -> Vec<AmqpError>;

    async fn producer(
        &self,
        ctx: &PublishContext,
        cfg: &ProducerConfig,
        msg: &Message,
    ) -> Result<(), AmqpError>;

    /// Subscribes once on the current session.
    async fn consumer(
        &self,
        cfg: &mut ConsumerConfig,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription, AmqpError>;

    /// Runs the reconnect loop for the lifetime of the process, keeping the
    /// consumer subscribed. Exits the process when reconnection gives up.
    async fn start_consumer(&self, cfg: ConsumerConfig, handler: Arc<dyn ConsumerHandler>);
}

struct LiveSession {
    session: Arc<dyn Session>,
    notifier: FailureNotifier,
}

/// Supervises one broker connection and its channel.
pub struct RabbitMQSupervisor {
    cfg: RabbitMQConfigs,
    connector: Arc<dyn Connector>,
    current: RwLock<Option<LiveSession>>,
    dial_lock: Mutex<()>,
    status: Arc<AtomicBool>,
    failures_tx: UnboundedSender<AmqpError>,
    failures_rx: Mutex<Option<UnboundedReceiver<AmqpError>>>,
    names: NameGenerator,
    consumers: Arc<ConsumerManager>,
}

impl RabbitMQSupervisor {
    /// Creates a supervisor that dials with lapin. Nothing is dialed yet.
    pub fn new(cfg: RabbitMQConfigs) -> Arc<RabbitMQSupervisor> {
        Self::with_connector(cfg, Arc::new(LapinConnector))
    }

    pub fn with_connector(
        cfg: RabbitMQConfigs,
        connector: Arc<dyn Connector>,
    ) -> Arc<RabbitMQSupervisor> {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        Arc::new(RabbitMQSupervisor {
            names: NameGenerator::new(&cfg.app_name),
            consumers: ConsumerManager::new(&cfg.app_name),
            cfg,
            connector,
            current: RwLock::new(None),
            dial_lock: Mutex::new(()),
            status: Arc::new(AtomicBool::new(false)),
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
        })
    }

    pub fn configs(&self) -> &RabbitMQConfigs {
        &self.cfg
    }

    /// The live session, refusing a closed one.
    async fn live_session(&self) -> Result<Arc<dyn Session>, AmqpError> {
        if !self.get_connect_status() {
            return Err(AmqpError::NotConnected);
        }

        match self.current.read().await.as_ref() {
            Some(live) => Ok(live.session.clone()),
            None => Err(AmqpError::NotConnected),
        }
    }

    /// The reconnect loop behind [`AmqpBroker::start_consumer`].
    ///
    /// Only returns on a fatal condition: the reconnect ceiling was reached, or
    /// another loop already owns the failure channel.
    pub async fn supervise(
        &self,
        cfg: ConsumerConfig,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Infallible, AmqpError> {
        let Some(mut failures) = self.failures_rx.lock().await.take() else {
            error!("supervisor loop already running");
            return Err(AmqpError::SupervisorAlreadyRunning);
        };

        let max_attempts = self.cfg.max_reconnect_times;
        let backoff = self.cfg.reconnect_backoff();
        let mut attempts: u32 = 0;
        let mut restart: Option<Subscription> = None;

        let result = loop {
            if self.get_connect_status() {
                restart = self.restart_consumer(restart.take(), &cfg, &handler).await;
            }

            if attempts >= max_attempts {
                error!(attempts, "failure to reconnect to rabbitmq, giving up");
                break AmqpError::ReconnectAttemptsExceeded(attempts);
            }

            let Some(failure) = failures.recv().await else {
                break AmqpError::InternalError;
            };

            warn!(
                error = failure.to_string(),
                "connection is closed, trying to reconnect in rabbitmq"
            );

            match self.connect().await {
                Err(err) => {
                    attempts += 1;
                    // a session that died while connecting already queued its own signal
                    if failures.is_empty() && self.failures_tx.send(failure).is_err() {
                        break AmqpError::InternalError;
                    }
                    warn!(
                        attempts,
                        error = err.to_string(),
                        "waiting {} seconds to try again",
                        backoff.as_secs()
                    );
                    tokio::time::sleep(backoff).await;
                }
                Ok(_) => {
                    attempts = 0;
                    info!("rabbitmq reconnected");
                }
            }
        };

        if let Some(previous) = restart.take() {
            previous.abort();
        }

        // a later loop may pick the channel up again
        *self.failures_rx.lock().await = Some(failures);

        Err(result)
    }

    /// Replaces `previous` with a fresh subscription on the live session.
    ///
    /// A previous subscription still registered on the live session is
    /// cancelled on the broker; one on a dead session is only aborted.
    async fn restart_consumer(
        &self,
        previous: Option<Subscription>,
        cfg: &ConsumerConfig,
        handler: &Arc<dyn ConsumerHandler>,
    ) -> Option<Subscription> {
        let session = self.live_session().await.ok();

        if let Some(previous) = previous {
            match &session {
                Some(live) if Arc::ptr_eq(previous.session(), live) && !previous.is_finished() => {
                    if let Err(err) = previous.cancel().await {
                        warn!(error = err.to_string(), "previous consumer was not cancelled");
                    }
                }
                _ => previous.abort(),
            }
        }

        let session = session?;
        let mut cfg = cfg.clone();

        debug!(queue = cfg.queue, "starting consumer");
        self.consumers
            .consume(session, &mut cfg, handler.clone())
            .await
            .ok()
    }
}

#[async_trait]
impl AmqpBroker for RabbitMQSupervisor {
    async fn connect(&self) -> Result<Arc<dyn Session>, AmqpError> {
        let _dialing = self.dial_lock.lock().await;

        if self.get_connect_status() {
            if let Some(live) = self.current.read().await.as_ref() {
                info!("there is already a connection, returning it");
                return Ok(live.session.clone());
            }
        }

        let name = self.names.next(&self.cfg.app_name);
        let session = match self.connector.dial(self.cfg.uri(), &name).await {
            Ok(session) => session,
            Err(err) => {
                error!(error = err.to_string(), "error to connect in rabbitmq");
                return Err(err);
            }
        };

        let notifier = FailureNotifier::new(self.status.clone(), self.failures_tx.clone());

        let previous = self.current.write().await.replace(LiveSession {
            session: session.clone(),
            notifier: notifier.clone(),
        });
        if let Some(stale) = previous {
            stale.notifier.disarm();
            tokio::spawn(async move {
                if let Err(err) = stale.session.close().await {
                    debug!(error = err.to_string(), "stale connection already closed");
                }
            });
        }

        // liveness goes up before the listeners exist, so a closure reported
        // from here on always wins
        self.status.store(true, Ordering::SeqCst);
        session.on_failure(notifier.clone());

        if notifier.has_fired() {
            let mut current = self.current.write().await;
            if current
                .as_ref()
                .is_some_and(|live| Arc::ptr_eq(&live.session, &session))
            {
                current.take();
            }

            error!(connection = name, "rabbitmq connection closed while connecting");
            return Err(AmqpError::ConnectionClosed(format!(
                "connection {} closed while connecting",
                name
            )));
        }

        info!(connection = name, "new rabbitmq connection success");
        Ok(session)
    }

    async fn get_connect(&self) -> Option<Arc<dyn Session>> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|live| live.session.clone())
    }

    fn get_connect_status(&self) -> bool {
        self.status.load(Ordering::SeqCst)
    }

    async fn close_connection(&self) -> Result<(), AmqpError> {
        let Some(live) = self.current.write().await.take() else {
            return Err(AmqpError::NotConnected);
        };

        live.notifier.disarm();
        self.status.store(false, Ordering::SeqCst);

        match live.session.close().await {
            Err(err) => {
                error!(error = err.to_string(), "error closing rabbit connection");
                Err(err)
            }
            Ok(()) => {
                info!("rabbitmq connection closed successfully");
                Ok(())
            }
        }
    }

    async fn simple_queue_declare(&self, spec: &QueueSpec) -> Result<QueueInfo, AmqpError> {
        let session = self.live_session().await?;
        AmqpTopology::new(session.as_ref()).declare_queue(spec).await
    }

    async fn complete_queue_declare(&self, specs: &[QueueSpec]) -> Vec<AmqpError> {
        let session = match self.live_session().await {
            Ok(session) => session,
            Err(err) => return vec![err],
        };

        let specs = specs.iter().collect::<Vec<_>>();
        AmqpTopology::new(session.as_ref())
            .declare_queues(&specs)
            .await
    }

    async fn simple_exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), AmqpError> {
        let session = self.live_session().await?;
        AmqpTopology::new(session.as_ref())
            .declare_exchange(spec)
            .await
    }

    async fn complete_exchange_declare(&self, specs: &[ExchangeSpec]) -> Vec<AmqpError> {
        let session = match self.live_session().await {
            Ok(session) => session,
            Err(err) => return vec![err],
        };

        let specs = specs.iter().collect::<Vec<_>>();
        AmqpTopology::new(session.as_ref())
            .declare_exchanges(&specs)
            .await
    }

    async fn complete_declare(
        &self,
        queues: &[QueueSpec],
        exchanges: &[ExchangeSpec],
    ) -> Vec<AmqpError> {
        let session = match self.live_session().await {
            Ok(session) => session,
            Err(err) => return vec![err],
        };

        let topology = exchanges
            .iter()
            .fold(AmqpTopology::new(session.as_ref()), |topology, spec| {
                topology.exchange(spec)
            });

        queues
            .iter()
            .fold(topology, |topology, spec| topology.queue(spec))
            .install()
            .await
    }

    async fn producer(
        &self,
        ctx: &PublishContext,
        cfg: &ProducerConfig,
        msg: &Message,
    ) -> Result<(), AmqpError> {
        let session = self.live_session().await?;
        publisher::publish(session.as_ref(), ctx, cfg, msg).await
    }

    async fn consumer(
        &self,
        cfg: &mut ConsumerConfig,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription, AmqpError> {
        let session = self.live_session().await?;
        self.consumers.consume(session, cfg, handler).await
    }

    async fn start_consumer(&self, cfg: ConsumerConfig, handler: Arc<dyn ConsumerHandler>) {
        match self.supervise(cfg, handler).await {
            Ok(never) => match never {},
            Err(err) => {
                error!(error = err.to_string(), "rabbitmq supervisor stopped");
                std::process::exit(1);
            }
        }
    }
}
