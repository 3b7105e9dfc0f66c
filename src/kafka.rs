// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Kafka Adapter
//!
//! Topic style broker on top of `rdkafka`. Kafka has no connection object of its own,
//! so a `KafkaConnection` bundles one `FutureProducer` and one `AdminClient`; each
//! receiver gets its own `StreamConsumer` in the configured group.
//!
//! Offsets are stored explicitly (`enable.auto.offset.store=false`) and committed by
//! the driver's auto commit:
//! - ack stores `offset + 1`
//! - nack with requeue seeks the partition back to the message offset
//! - nack without requeue copies the message to the dead-letter topic, then stores
//!   the offset so the message is not seen again

use crate::{
    config::BrokerConfig,
    errors::BrokerError,
    message::{self, Message},
    transport::{
        Acknowledger, Admin, Connection, Connector, DeadLetterLayout, Delivery,
        DestinationDefinition, DestinationKind, Receiver, Sender,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use rdkafka::{
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    config::ClientConfig,
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    message::{Header, Headers, Message as _, OwnedHeaders, OwnedMessage},
    producer::{FutureProducer, FutureRecord},
    types::RDKafkaErrorCode,
    util::Timeout,
    Offset,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates `rdkafka` producers, consumers and admin clients from a `BrokerConfig`.
pub struct KafkaConnector {
    cfg: Arc<BrokerConfig>,
}

impl KafkaConnector {
    /// Creates a new Kafka connector.
    ///
    /// # Parameters
    /// * `cfg` - Resolved configuration; bootstrap servers, group and offset settings
    ///
    /// # Returns
    /// A connector; no client is created until `connect`
    pub fn new(cfg: &BrokerConfig) -> Self {
        KafkaConnector {
            cfg: Arc::new(cfg.clone()),
        }
    }
}

fn client_config(cfg: &BrokerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", cfg.bootstrap_servers());
    client_config.set("client.id", &cfg.client_id);
    client_config
}

fn producer_config(cfg: &BrokerConfig) -> ClientConfig {
    let mut client_config = client_config(cfg);
    client_config.set("acks", cfg.ack_mode.as_str());
    client_config.set("enable.idempotence", cfg.idempotent.to_string());
    client_config.set("message.timeout.ms", cfg.send_timeout.as_millis().to_string());
    client_config
}

fn consumer_config(cfg: &BrokerConfig) -> ClientConfig {
    let mut client_config = client_config(cfg);
    client_config.set("group.id", &cfg.group_id);
    client_config.set("auto.offset.reset", cfg.offset_reset.as_str());
    client_config.set("enable.auto.commit", "true");
    client_config.set("enable.auto.offset.store", "false");
    client_config.set("session.timeout.ms", cfg.session_timeout.as_millis().to_string());
    client_config.set(
        "heartbeat.interval.ms",
        cfg.heartbeat_interval.as_millis().to_string(),
    );
    client_config.set(
        "auto.commit.interval.ms",
        cfg.auto_commit_interval.as_millis().to_string(),
    );
    client_config
}

#[async_trait]
impl Connector for KafkaConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        debug!("creating kafka clients...");

        let producer: FutureProducer = producer_config(&self.cfg)
            .create()
            .map_err(|err| connection_error("failure to create the producer", err))?;
        let admin: AdminClient<DefaultClientContext> = client_config(&self.cfg)
            .create()
            .map_err(|err| connection_error("failure to create the admin client", err))?;

        debug!("kafka clients created");
        Ok(Arc::new(KafkaConnection {
            cfg: self.cfg.clone(),
            producer,
            admin: Arc::new(admin),
            closed: AtomicBool::new(false),
        }))
    }

    fn dead_letter_layout(&self, cfg: &BrokerConfig) -> DeadLetterLayout {
        DeadLetterLayout::topic(cfg)
    }
}

fn connection_error(msg: &str, err: KafkaError) -> BrokerError {
    error!(error = err.to_string(), "{}", msg);
    match err {
        KafkaError::ClientConfig(..) | KafkaError::ClientCreation(_) => {
            BrokerError::Config(err.to_string())
        }
        _ => BrokerError::Connection(err.to_string()),
    }
}

pub struct KafkaConnection {
    cfg: Arc<BrokerConfig>,
    producer: FutureProducer,
    admin: Arc<AdminClient<DefaultClientContext>>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for KafkaConnection {
    async fn open_sender(&self) -> Result<Arc<dyn Sender>, BrokerError> {
        Ok(Arc::new(KafkaSender {
            producer: self.producer.clone(),
            send_timeout: self.cfg.send_timeout,
        }))
    }

    async fn open_receiver(&self, destination: &str) -> Result<Box<dyn Receiver>, BrokerError> {
        let consumer: StreamConsumer = consumer_config(&self.cfg)
            .create()
            .map_err(|err| connection_error("failure to create the consumer", err))?;

        consumer.subscribe(&[destination]).map_err(|err| {
            error!(error = err.to_string(), topic = destination, "failure to subscribe");
            BrokerError::Consume {
                destination: destination.to_owned(),
                reason: err.to_string(),
            }
        })?;
        debug!("subscribed to topic: {}", destination);

        Ok(Box::new(KafkaReceiver {
            destination: destination.to_owned(),
            consumer: Arc::new(consumer),
            dead_letter: KafkaSender {
                producer: self.producer.clone(),
                send_timeout: self.cfg.send_timeout,
            },
            dead_letter_topic: self.cfg.dead_letter_topic.clone(),
        }))
    }

    async fn admin(&self) -> Result<Arc<dyn Admin>, BrokerError> {
        Ok(Arc::new(KafkaAdmin {
            client: self.admin.clone(),
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Clone)]
pub struct KafkaSender {
    producer: FutureProducer,
    send_timeout: Duration,
}

#[async_trait]
impl Sender for KafkaSender {
    async fn send(&self, message: &Message) -> Result<(), BrokerError> {
        let headers = to_owned_headers(message.headers());
        let mut record = FutureRecord::to(message.destination())
            .payload(message.payload())
            .headers(headers);
        if let Some(key) = message.key() {
            record = record.key(key);
        }

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => {
                debug!(topic = message.destination(), partition, offset, "message delivered");
                Ok(())
            }
            Err((err, _)) => {
                error!(error = err.to_string(), "error publishing message");
                Err(BrokerError::Publishing {
                    destination: message.destination().to_owned(),
                    reason: err.to_string(),
                })
            }
        }
    }
}

pub struct KafkaReceiver {
    destination: String,
    consumer: Arc<StreamConsumer>,
    dead_letter: KafkaSender,
    dead_letter_topic: String,
}

#[async_trait]
impl Receiver for KafkaReceiver {
    async fn next_batch(&mut self) -> Result<Option<Vec<Delivery>>, BrokerError> {
        let owned = match self.consumer.recv().await {
            Ok(msg) => msg.detach(),
            Err(err) => {
                error!(error = err.to_string(), "errors consume msg");
                return Err(BrokerError::Consume {
                    destination: self.destination.clone(),
                    reason: err.to_string(),
                });
            }
        };

        let message = to_message(&owned);
        let acker = KafkaAcknowledger {
            consumer: self.consumer.clone(),
            dead_letter: self.dead_letter.clone(),
            dead_letter_topic: self.dead_letter_topic.clone(),
            topic: owned.topic().to_owned(),
            partition: owned.partition(),
            offset: owned.offset(),
            message: message.clone(),
        };

        Ok(Some(vec![Delivery::new(message, Box::new(acker))]))
    }
}

pub struct KafkaAcknowledger {
    consumer: Arc<StreamConsumer>,
    dead_letter: KafkaSender,
    dead_letter_topic: String,
    topic: String,
    partition: i32,
    offset: i64,
    message: Message,
}

impl KafkaAcknowledger {
    fn store(&self) -> Result<(), KafkaError> {
        self.consumer
            .store_offset(&self.topic, self.partition, self.offset + 1)
    }
}

#[async_trait]
impl Acknowledger for KafkaAcknowledger {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.store().map_err(|err| BrokerError::Ack(err.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            return self
                .consumer
                .seek(
                    &self.topic,
                    self.partition,
                    Offset::Offset(self.offset),
                    SEEK_TIMEOUT,
                )
                .map_err(|err| BrokerError::Nack(err.to_string()));
        }

        let dead = self
            .message
            .redirect(&self.dead_letter_topic)
            .header(message::HEADER_ORIGINAL_DESTINATION, self.topic.as_bytes())
            .header(message::HEADER_DEAD_LETTERED_AT, Utc::now().to_rfc3339())
            .build();
        if let Err(err) = self.dead_letter.send(&dead).await {
            warn!(
                error = err.to_string(),
                topic = self.topic,
                offset = self.offset,
                "failure to forward rejected message to the dead letter topic"
            );
            return Err(BrokerError::Nack(err.to_string()));
        }

        self.store().map_err(|err| BrokerError::Nack(err.to_string()))
    }
}

pub struct KafkaAdmin {
    client: Arc<AdminClient<DefaultClientContext>>,
}

#[async_trait]
impl Admin for KafkaAdmin {
    async fn declare_destination(&self, def: &DestinationDefinition) -> Result<(), BrokerError> {
        let (partitions, replication) = match def.kind {
            DestinationKind::Topic {
                partitions,
                replication,
            } => (partitions, replication),
            _ => (1, 1),
        };

        let topic = NewTopic::new(&def.name, partitions, TopicReplication::Fixed(replication));
        let declare_error = |reason: String| BrokerError::DeclareDestination {
            name: def.name.clone(),
            reason,
        };

        let results = self
            .client
            .create_topics(&[topic], &AdminOptions::new())
            .await
            .map_err(|err| declare_error(err.to_string()))?;

        for result in results {
            match result {
                Ok(name) => debug!("topic: {} created", name),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    return Err(BrokerError::AlreadyExists(name))
                }
                Err((_, code)) => return Err(declare_error(code.to_string())),
            }
        }

        Ok(())
    }

    /// Topics carry no dead-letter binding; rejected messages are forwarded by the
    /// acknowledger.
    async fn bind_dead_letter(&self, _destination: &str, _dead_letter: &str) -> Result<(), BrokerError> {
        Ok(())
    }
}

fn to_owned_headers(headers: &BTreeMap<String, Vec<u8>>) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (k, v)| {
            acc.insert(Header {
                key: k.as_str(),
                value: Some(v.as_slice()),
            })
        })
}

fn to_message(owned: &OwnedMessage) -> Message {
    let mut headers = BTreeMap::new();
    if let Some(h) = owned.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                headers.insert(header.key.to_owned(), value.to_vec());
            }
        }
    }

    Message::builder(owned.topic(), owned.payload().unwrap_or_default())
        .maybe_key(owned.key())
        .headers(headers)
        .build()
}
