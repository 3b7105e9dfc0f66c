// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! End to end behaviour of the client against an in-memory topic broker.

use async_trait::async_trait;
use resilient_broker::{
    client::BrokerClient,
    config::BrokerSettings,
    consumer::MessageHandler,
    errors::{BoxError, BrokerError},
    message::{Message, HEADER_ORIGINAL_DESTINATION},
    middleware::Pipeline,
    transport::{
        Acknowledger, Admin, Connection, Connector, DeadLetterLayout, Delivery,
        DestinationDefinition, Receiver, Sender,
    },
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{mpsc, Notify},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, VecDeque<Message>>,
    declared: HashSet<String>,
    send_failures: HashMap<String, u32>,
    refuse_declare: bool,
    acked: u32,
}

#[derive(Clone, Default)]
struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    fn fail_sends(&self, destination: &str, times: u32) {
        let mut state = self.state.lock().unwrap();
        state.send_failures.insert(destination.to_owned(), times);
    }

    fn refuse_declare(&self) {
        self.state.lock().unwrap().refuse_declare = true;
    }

    fn messages(&self, topic: &str) -> Vec<Message> {
        let state = self.state.lock().unwrap();
        state
            .topics
            .get(topic)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn acked(&self) -> u32 {
        self.state.lock().unwrap().acked
    }

    fn push(&self, message: Message, front: bool) {
        {
            let mut state = self.state.lock().unwrap();
            let queue = state.topics.entry(message.destination().to_owned()).or_default();
            if front {
                queue.push_front(message);
            } else {
                queue.push_back(message);
            }
        }
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        Ok(Arc::new(self.clone()))
    }

    fn dead_letter_layout(&self, cfg: &resilient_broker::config::BrokerConfig) -> DeadLetterLayout {
        DeadLetterLayout::topic(cfg)
    }
}

#[async_trait]
impl Connection for MemoryBroker {
    async fn open_sender(&self) -> Result<Arc<dyn Sender>, BrokerError> {
        Ok(Arc::new(self.clone()))
    }

    async fn open_receiver(&self, destination: &str) -> Result<Box<dyn Receiver>, BrokerError> {
        Ok(Box::new(MemoryReceiver {
            broker: self.clone(),
            topic: destination.to_owned(),
        }))
    }

    async fn admin(&self) -> Result<Arc<dyn Admin>, BrokerError> {
        Ok(Arc::new(self.clone()))
    }

    fn is_closed(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[async_trait]
impl Sender for MemoryBroker {
    async fn send(&self, message: &Message) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(left) = state.send_failures.get_mut(message.destination()) {
                if *left > 0 {
                    *left -= 1;
                    return Err(BrokerError::Publishing {
                        destination: message.destination().to_owned(),
                        reason: "broker unavailable".into(),
                    });
                }
            }
        }
        self.push(message.clone(), false);
        Ok(())
    }
}

#[async_trait]
impl Admin for MemoryBroker {
    async fn declare_destination(&self, def: &DestinationDefinition) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_declare {
            return Err(BrokerError::DeclareDestination {
                name: def.name.clone(),
                reason: "not authorized".into(),
            });
        }
        if !state.declared.insert(def.name.clone()) {
            return Err(BrokerError::AlreadyExists(def.name.clone()));
        }
        Ok(())
    }

    async fn bind_dead_letter(&self, _destination: &str, _dead_letter: &str) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct MemoryReceiver {
    broker: MemoryBroker,
    topic: String,
}

#[async_trait]
impl Receiver for MemoryReceiver {
    async fn next_batch(&mut self) -> Result<Option<Vec<Delivery>>, BrokerError> {
        loop {
            let notified = self.broker.notify.notified();
            let next = {
                let mut state = self.broker.state.lock().unwrap();
                state.topics.get_mut(&self.topic).and_then(VecDeque::pop_front)
            };
            if let Some(message) = next {
                let acker = MemoryAcker {
                    broker: self.broker.clone(),
                    message: message.clone(),
                };
                return Ok(Some(vec![Delivery::new(message, Box::new(acker))]));
            }
            notified.await;
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    message: Message,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.broker.state.lock().unwrap().acked += 1;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            self.broker.push(self.message.clone(), true);
        } else {
            let dead = self
                .message
                .redirect("dlq.topic")
                .header(HEADER_ORIGINAL_DESTINATION, self.message.destination())
                .build();
            self.broker.push(dead, false);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    item: String,
}

struct Recorder {
    tx: mpsc::UnboundedSender<Order>,
}

#[async_trait]
impl MessageHandler<Order> for Recorder {
    async fn handle(&self, _token: &CancellationToken, order: &Order) -> Result<(), BoxError> {
        self.tx.send(order.clone())?;
        Ok(())
    }
}

fn settings(max_retries: u32) -> BrokerSettings {
    BrokerSettings {
        max_retries: Some(max_retries),
        retry_delay_ms: Some(1000),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn publish_succeeds_after_two_transient_failures() {
    let broker = MemoryBroker::default();
    broker.fail_sends("orders", 2);
    let client = BrokerClient::connect(Arc::new(broker.clone()), settings(2))
        .await
        .unwrap();
    let start = Instant::now();

    client
        .publish(&CancellationToken::new(), "orders", Some(b"k1"), b"{}", &Pipeline::new())
        .await
        .unwrap();

    assert_eq!(start.elapsed(), Duration::from_secs(2));
    assert_eq!(broker.messages("orders").len(), 1);
    assert!(broker.messages("dlq.topic").is_empty());
}

#[tokio::test(start_paused = true)]
async fn publish_falls_back_to_dead_letter_topic() {
    let broker = MemoryBroker::default();
    broker.fail_sends("orders", u32::MAX);
    let client = BrokerClient::connect(Arc::new(broker.clone()), settings(1))
        .await
        .unwrap();

    let err = client
        .publish(&CancellationToken::new(), "orders", None, b"{}", &Pipeline::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BrokerError::DeadLettered {
            attempts: 2,
            ref destination,
            ..
        } if destination == "orders"
    ));
    let dead = broker.messages("dlq.topic");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].header_str(HEADER_ORIGINAL_DESTINATION), Some("orders"));
}

#[tokio::test]
async fn connect_fails_when_dead_letter_cannot_be_provisioned() {
    let broker = MemoryBroker::default();
    broker.refuse_declare();

    let result = BrokerClient::connect(Arc::new(broker), settings(1)).await;

    assert!(matches!(result, Err(BrokerError::DeclareDestination { .. })));
}

#[tokio::test]
async fn subscription_delivers_published_messages_in_order() {
    let broker = MemoryBroker::default();
    let client = BrokerClient::connect(Arc::new(broker.clone()), settings(1))
        .await
        .unwrap();
    let token = CancellationToken::new();
    let pipeline = Pipeline::new();

    for id in 1..=3 {
        let order = Order {
            id,
            item: format!("item-{id}"),
        };
        client
            .publish_json(&token, "orders", &order, &pipeline)
            .await
            .unwrap();
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = client.subscribe_json::<Order, _>("orders", Recorder { tx }, Pipeline::new());

    let mut ids = Vec::new();
    for _ in 0..3 {
        let order = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        ids.push(order.id);
    }

    assert_eq!(ids, vec![1, 2, 3]);
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(broker.acked(), 3);
    client.close().await;
}

#[tokio::test]
async fn undecodable_message_is_dead_lettered_without_calling_handler() {
    let broker = MemoryBroker::default();
    let client = BrokerClient::connect(Arc::new(broker.clone()), settings(1))
        .await
        .unwrap();

    client
        .publish(&CancellationToken::new(), "orders", None, b"not json", &Pipeline::new())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = client.subscribe_json::<Order, _>("orders", Recorder { tx }, Pipeline::new());

    let deadline = Instant::now() + Duration::from_secs(5);
    while broker.messages("dlq.topic").is_empty() {
        assert!(Instant::now() < deadline, "message was not dead lettered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
    assert!(rx.try_recv().is_err());
    assert_eq!(broker.acked(), 0);
    assert_eq!(
        broker.messages("dlq.topic")[0].header_str(HEADER_ORIGINAL_DESTINATION),
        Some("orders")
    );
}

#[tokio::test]
async fn closing_the_client_stops_subscriptions() {
    let broker = MemoryBroker::default();
    let client = BrokerClient::connect(Arc::new(broker), settings(1))
        .await
        .unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let handle = client.subscribe_json::<Order, _>("orders", Recorder { tx }, Pipeline::new());

    client.close().await;

    assert!(tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .unwrap()
        .is_ok());
}
