// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capability Interface
//!
//! The resilience core (publisher, consumer loop, connection manager, provisioner) is
//! written once against these traits. Each broker supplies an adapter:
//!
//! - `amqp`: exchange/queue style broker on top of `lapin`
//! - `kafka`: topic style broker on top of `rdkafka`
//!
//! Adapters only translate; retries, dead lettering and reconnect policy live in the core.

use crate::{config::BrokerConfig, errors::BrokerError, message::Message};
use async_trait::async_trait;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Shape of the dead-letter destination a broker uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterLayout {
    /// A single topic with a fixed partition and replication count.
    Topic {
        topic: String,
        partitions: i32,
        replication: i32,
    },
    /// A direct exchange with one queue bound to it.
    Exchange { exchange: String, queue: String },
}

impl DeadLetterLayout {
    pub fn topic(cfg: &BrokerConfig) -> Self {
        DeadLetterLayout::Topic {
            topic: cfg.dead_letter_topic.clone(),
            partitions: cfg.dead_letter_partitions,
            replication: cfg.dead_letter_replication,
        }
    }

    pub fn exchange(cfg: &BrokerConfig) -> Self {
        DeadLetterLayout::Exchange {
            exchange: cfg.dead_letter_exchange.clone(),
            queue: cfg.dead_letter_queue.clone(),
        }
    }

    /// Destination the publisher sends exhausted messages to.
    ///
    /// For exchange style brokers this is the dead-letter queue, addressed directly.
    pub fn publish_target(&self) -> &str {
        match self {
            DeadLetterLayout::Topic { topic, .. } => topic,
            DeadLetterLayout::Exchange { queue, .. } => queue,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationKind {
    Topic { partitions: i32, replication: i32 },
    Exchange,
    Queue { dead_letter_exchange: Option<String> },
}

/// Administrative description of a destination to declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationDefinition {
    pub name: String,
    pub kind: DestinationKind,
    pub durable: bool,
}

impl DestinationDefinition {
    pub fn topic(name: &str, partitions: i32, replication: i32) -> Self {
        DestinationDefinition {
            name: name.to_owned(),
            kind: DestinationKind::Topic {
                partitions,
                replication,
            },
            durable: true,
        }
    }

    pub fn exchange(name: &str) -> Self {
        DestinationDefinition {
            name: name.to_owned(),
            kind: DestinationKind::Exchange,
            durable: true,
        }
    }

    pub fn queue(name: &str, dead_letter_exchange: Option<&str>) -> Self {
        DestinationDefinition {
            name: name.to_owned(),
            kind: DestinationKind::Queue {
                dead_letter_exchange: dead_letter_exchange.map(str::to_owned),
            },
            durable: true,
        }
    }
}

/// Opens connections to one broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens the transport and applies per-connection settings (QoS, heartbeat).
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError>;

    /// Dead-letter shape used by this broker.
    fn dead_letter_layout(&self, cfg: &BrokerConfig) -> DeadLetterLayout;
}

/// A live broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_sender(&self) -> Result<Arc<dyn Sender>, BrokerError>;

    async fn open_receiver(&self, destination: &str) -> Result<Box<dyn Receiver>, BrokerError>;

    async fn admin(&self) -> Result<Arc<dyn Admin>, BrokerError>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Sender: Send + Sync {
    /// Delivers one message to `message.destination()`.
    async fn send(&self, message: &Message) -> Result<(), BrokerError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Receiver: Send {
    /// Next batch of deliveries, in delivery order. `None` once the stream is closed.
    async fn next_batch(&mut self) -> Result<Option<Vec<Delivery>>, BrokerError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Admin: Send + Sync {
    /// Declares a destination. Returns `BrokerError::AlreadyExists` when the broker
    /// reports the destination exists.
    async fn declare_destination(&self, def: &DestinationDefinition) -> Result<(), BrokerError>;

    async fn bind_dead_letter(&self, destination: &str, dead_letter: &str)
        -> Result<(), BrokerError>;
}

/// Settles one delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A received message together with the handle that settles it.
pub struct Delivery {
    pub message: Message,
    pub acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acknowledger>) -> Self {
        Delivery { message, acker }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
