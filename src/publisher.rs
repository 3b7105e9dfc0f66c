// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes messages with bounded retries and a dead-letter fallback:
//!
//! 1. The middleware pipeline runs once; a rejection aborts without retry.
//! 2. Delivery is attempted `max_retries + 1` times, separated by the constant retry delay.
//!    The cancellation token is checked before every attempt.
//! 3. When every attempt failed, one copy is sent to the dead-letter destination. The call
//!    still fails: `DeadLettered` when the copy was stored, `DeadLetterFailed` otherwise.

use crate::{
    backoff::{self, Backoff},
    config::BrokerConfig,
    connection::ConnectionManager,
    errors::BrokerError,
    message::{
        Message, HEADER_DEAD_LETTERED_AT, HEADER_DELIVERY_ATTEMPTS, HEADER_LAST_ERROR,
        HEADER_MESSAGE_ID, HEADER_ORIGINAL_DESTINATION,
    },
    middleware::Pipeline,
    otel,
    transport::Sender,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Transient record of one publish call.
#[derive(Debug)]
pub struct DeliveryAttempt {
    pub attempts: u32,
    pub last_error: Option<BrokerError>,
}

impl DeliveryAttempt {
    fn new() -> Self {
        DeliveryAttempt {
            attempts: 0,
            last_error: None,
        }
    }

    fn failed(&mut self, err: BrokerError) {
        self.attempts += 1;
        self.last_error = Some(err);
    }

    fn into_error(self, destination: &str) -> BrokerError {
        self.last_error.unwrap_or_else(|| BrokerError::Publishing {
            destination: destination.to_owned(),
            reason: "no delivery attempt was made".to_owned(),
        })
    }
}

/// Publisher with bounded retries and a dead-letter fallback.
///
/// Sends go through a sender opened on the connection owned by the shared
/// `ConnectionManager`. The sender is cached per connection generation and reopened
/// after a transport failure.
pub struct Publisher {
    connections: Arc<ConnectionManager>,
    sender: Mutex<Option<(u64, Arc<dyn Sender>)>>,
    max_retries: u32,
    backoff: Backoff,
    dead_letter: String,
}

impl Publisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `connections` - Connection manager providing the broker connection
    /// * `cfg` - Resolved configuration; `max_retries` and `retry_delay` drive the retry loop
    /// * `dead_letter` - Destination receiving messages whose attempts were exhausted
    ///
    /// # Returns
    /// A new publisher with no sender opened yet
    pub fn new(connections: Arc<ConnectionManager>, cfg: &BrokerConfig, dead_letter: &str) -> Self {
        Publisher {
            connections,
            sender: Mutex::new(None),
            max_retries: cfg.max_retries,
            backoff: Backoff::Constant(cfg.retry_delay),
            dead_letter: dead_letter.to_owned(),
        }
    }

    pub fn dead_letter(&self) -> &str {
        &self.dead_letter
    }

    /// Publishes `payload` to `destination`.
    ///
    /// # Parameters
    /// * `token` - Cancellation token checked before every attempt and during retry sleeps
    /// * `destination` - Topic or queue name
    /// * `key` - Optional message key (partitioning key on topic brokers)
    /// * `payload` - Raw message body
    /// * `pipeline` - Middlewares run once before the first attempt
    ///
    /// # Returns
    /// `Ok(())` once delivered, `DeadLettered`/`DeadLetterFailed` when every attempt
    /// failed, `Middleware` on a rejection, `Cancelled` when the token fired
    pub async fn publish(
        &self,
        token: &CancellationToken,
        destination: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        pipeline: &Pipeline,
    ) -> Result<(), BrokerError> {
        let message = Message::builder(destination, payload).maybe_key(key).build();
        self.publish_message(token, message, pipeline).await
    }

    /// Serializes `body` as JSON and publishes it.
    pub async fn publish_json<T: Serialize + Sync>(
        &self,
        token: &CancellationToken,
        destination: &str,
        body: &T,
        pipeline: &Pipeline,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(body).map_err(|source| BrokerError::Serialization {
            destination: destination.to_owned(),
            source,
        })?;
        self.publish(token, destination, None, &payload, pipeline).await
    }

    /// Publishes a prebuilt message, keeping its key and headers.
    pub async fn publish_message(
        &self,
        token: &CancellationToken,
        message: Message,
        pipeline: &Pipeline,
    ) -> Result<(), BrokerError> {
        let destination = message.destination().to_owned();

        pipeline.run(token, &destination, message.payload()).await?;

        let mut headers = otel::inject_current(message.headers().clone());
        headers
            .entry(HEADER_MESSAGE_ID.to_owned())
            .or_insert_with(|| Uuid::new_v4().to_string().into_bytes());
        let message = message.redirect(&destination).headers(headers).build();

        let attempts = self.max_retries.saturating_add(1);
        let mut record = DeliveryAttempt::new();

        for attempt in 0..attempts {
            if token.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }

            match self.send(&message).await {
                Ok(()) => {
                    debug!(destination = destination, attempt = attempt + 1, "message published");
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        destination = destination,
                        attempt = attempt + 1,
                        max = attempts,
                        "failure to publish message"
                    );
                    record.failed(err);
                }
            }

            if attempt + 1 < attempts {
                backoff::sleep(token, self.backoff.delay(attempt)).await?;
            }
        }

        self.dead_letter_message(&message, record).await
    }

    async fn dead_letter_message(
        &self,
        message: &Message,
        record: DeliveryAttempt,
    ) -> Result<(), BrokerError> {
        let destination = message.destination().to_owned();
        let attempts = record.attempts;
        let last_error = record.into_error(&destination);

        error!(
            destination = destination,
            attempts = attempts,
            "too many attempts, sending to dead letter"
        );

        let dead_letter = message
            .redirect(&self.dead_letter)
            .header(HEADER_ORIGINAL_DESTINATION, destination.as_str())
            .header(HEADER_DEAD_LETTERED_AT, chrono::Utc::now().to_rfc3339())
            .header(HEADER_DELIVERY_ATTEMPTS, attempts.to_string())
            .header(HEADER_LAST_ERROR, last_error.to_string())
            .build();

        match self.send(&dead_letter).await {
            Ok(()) => Err(BrokerError::DeadLettered {
                destination,
                attempts,
                source: Box::new(last_error),
            }),
            Err(dlq_err) => {
                error!(error = dlq_err.to_string(), "error whiling sending to dead letter");
                Err(BrokerError::DeadLetterFailed {
                    destination,
                    attempts,
                    source: Box::new(last_error),
                    dead_letter: Box::new(dlq_err),
                })
            }
        }
    }

    async fn send(&self, message: &Message) -> Result<(), BrokerError> {
        let sender = self.sender().await?;
        match sender.send(message).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if err.is_retryable() {
                    self.discard_sender(&sender).await;
                }
                Err(err)
            }
        }
    }

    /// Sender for the current connection, reopened when the connection was replaced
    /// or the previous sender failed.
    async fn sender(&self) -> Result<Arc<dyn Sender>, BrokerError> {
        let conn = match self.connections.current().await {
            Ok(conn) => conn,
            Err(BrokerError::Reconnecting) => return Err(BrokerError::Reconnecting),
            Err(_) => self.connections.refresh().await?,
        };
        let generation = self.connections.generation();

        let mut cached = self.sender.lock().await;
        if let Some((gen, sender)) = cached.as_ref() {
            if *gen == generation {
                return Ok(sender.clone());
            }
        }

        let sender = conn.open_sender().await?;
        *cached = Some((generation, sender.clone()));
        Ok(sender)
    }

    /// Forgets `failed` so the next attempt opens a fresh sender. A sender reopened
    /// in the meantime by another call is kept.
    async fn discard_sender(&self, failed: &Arc<dyn Sender>) {
        let mut cached = self.sender.lock().await;
        if matches!(cached.as_ref(), Some((_, sender)) if Arc::ptr_eq(sender, failed)) {
            debug!("discarding failed sender");
            *cached = None;
        }
    }
}
