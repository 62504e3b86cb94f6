// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Supervised RabbitMQ connection: one connection and channel per
//! [`supervisor::RabbitMQSupervisor`], bounded reconnection, topology
//! declaration, consumer restarts and publishing.

mod otel;

#[cfg(test)]
mod testing;

pub mod channel;
pub mod configs;
pub mod consumer;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod naming;
pub mod publisher;
pub mod queue;
pub mod supervisor;
pub mod topology;

pub use supervisor::{AmqpBroker, RabbitMQSupervisor};
