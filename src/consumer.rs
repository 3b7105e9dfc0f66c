// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Loop
//!
//! One background task per subscribed destination runs the state machine
//!
//! ```text
//! Disconnected -> Provisioning -> Consuming -> (connection lost) -> Disconnected
//!                                           -> (token cancelled) -> Terminal
//! ```
//!
//! Every delivery is processed in order:
//! 1. decode; failure nacks without requeue and the handler is never called
//! 2. run the middleware pipeline; failure nacks with requeue
//! 3. call the handler up to `handler_attempts` times with linear backoff; exhaustion
//!    nacks with requeue
//! 4. ack on success
//!
//! Settlement failures are logged and never retried: a redelivery is the accepted cost
//! of at-least-once delivery.

use crate::{
    backoff::{self, Backoff, ExponentialBackoff},
    config::BrokerConfig,
    connection::ConnectionManager,
    errors::{BoxError, BrokerError},
    middleware::Pipeline,
    otel,
    provisioner,
    transport::{Connector, DeadLetterLayout, Delivery},
};
use async_trait::async_trait;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, marker::PhantomData, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Turns a raw payload into the subscriber's type.
pub trait Decoder<T>: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<T, BoxError>;
}

impl<T, F> Decoder<T> for F
where
    F: Fn(&[u8]) -> Result<T, BoxError> + Send + Sync,
{
    fn decode(&self, payload: &[u8]) -> Result<T, BoxError> {
        self(payload)
    }
}

/// Decodes JSON payloads with `serde_json`.
pub struct JsonDecoder<T>(PhantomData<fn() -> T>);

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        JsonDecoder(PhantomData)
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        JsonDecoder::new()
    }
}

impl<T: DeserializeOwned> Decoder<T> for JsonDecoder<T> {
    fn decode(&self, payload: &[u8]) -> Result<T, BoxError> {
        serde_json::from_slice(payload).map_err(|e| Box::new(e) as BoxError)
    }
}

/// Business logic invoked for each decoded message.
#[async_trait]
pub trait MessageHandler<T: Send + Sync>: Send + Sync {
    async fn handle(&self, token: &CancellationToken, message: &T) -> Result<(), BoxError>;
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack { requeue: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Provisioning,
    Consuming,
    Terminal,
}

/// Per-message processing shared by every session of a subscription.
pub struct MessageProcessor<T, D, H> {
    destination: String,
    decoder: D,
    handler: H,
    pipeline: Pipeline,
    attempts: u32,
    backoff: Backoff,
    tracer: BoxedTracer,
    _marker: PhantomData<fn() -> T>,
}

impl<T, D, H> MessageProcessor<T, D, H>
where
    T: Send + Sync,
    D: Decoder<T>,
    H: MessageHandler<T>,
{
    pub fn new(destination: &str, decoder: D, handler: H, pipeline: Pipeline, cfg: &BrokerConfig) -> Self {
        MessageProcessor {
            destination: destination.to_owned(),
            decoder,
            handler,
            pipeline,
            attempts: cfg.handler_attempts.max(1),
            backoff: Backoff::Linear(cfg.handler_retry_delay),
            tracer: global::tracer(otel::CONSUMER_TRACER),
            _marker: PhantomData,
        }
    }

    /// Processes and settles one delivery.
    ///
    /// Returns `Err(Cancelled)` when the token fired during a handler backoff; the
    /// delivery has been requeued in that case.
    pub async fn process(
        &self,
        token: &CancellationToken,
        delivery: Delivery,
    ) -> Result<Disposition, BrokerError> {
        let Delivery { message, acker } = delivery;
        let (_ctx, mut span) = otel::new_span(message.headers(), &self.tracer, &self.destination);

        debug!("received message from: {}", self.destination);

        let (disposition, outcome) = self.evaluate(token, message.payload()).await;

        if let Err(err) = &outcome {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }

        let settled = match disposition {
            Disposition::Ack => acker.ack().await,
            Disposition::Nack { requeue } => acker.nack(requeue).await,
        };
        match settled {
            Ok(()) => {
                if outcome.is_ok() {
                    span.set_status(Status::Ok);
                    debug!("message processed and acked");
                }
            }
            Err(err) => {
                error!(error = err.to_string(), disposition = ?disposition, "error whiling settling msg");
                span.record_error(&err);
            }
        }
        span.end();

        match outcome {
            Err(BrokerError::Cancelled) => Err(BrokerError::Cancelled),
            _ => Ok(disposition),
        }
    }

    async fn evaluate(
        &self,
        token: &CancellationToken,
        payload: &[u8],
    ) -> (Disposition, Result<(), BrokerError>) {
        let decoded = match self.decoder.decode(payload) {
            Ok(value) => value,
            Err(source) => {
                warn!(error = source.to_string(), "removing message from queue - reason: undecodable payload");
                return (
                    Disposition::Nack { requeue: false },
                    Err(BrokerError::Decode {
                        destination: self.destination.clone(),
                        source,
                    }),
                );
            }
        };

        if let Err(err) = self.pipeline.run(token, &self.destination, payload).await {
            return (Disposition::Nack { requeue: true }, Err(err));
        }

        let mut attempt = 0;
        loop {
            let source = match self.handler.handle(token, &decoded).await {
                Ok(()) => return (Disposition::Ack, Ok(())),
                Err(source) => source,
            };
            attempt += 1;

            warn!(
                error = source.to_string(),
                attempt = attempt,
                max = self.attempts,
                "error whiling handling msg"
            );

            if attempt >= self.attempts {
                return (
                    Disposition::Nack { requeue: true },
                    Err(BrokerError::Handler {
                        destination: self.destination.clone(),
                        attempts: attempt,
                        source,
                    }),
                );
            }

            if let Err(err) = backoff::sleep(token, self.backoff.delay(attempt - 1)).await {
                return (Disposition::Nack { requeue: true }, Err(err));
            }
        }
    }
}

/// Runtime state of one subscribed destination.
pub struct ConsumerSession<T, D, H> {
    destination: String,
    connections: ConnectionManager,
    layout: DeadLetterLayout,
    backoff: ExponentialBackoff,
    processor: MessageProcessor<T, D, H>,
    token: CancellationToken,
    state: ConsumerState,
}

impl<T, D, H> ConsumerSession<T, D, H>
where
    T: Send + Sync,
    D: Decoder<T>,
    H: MessageHandler<T>,
{
    pub fn new(
        connector: Arc<dyn Connector>,
        cfg: &BrokerConfig,
        processor: MessageProcessor<T, D, H>,
        token: CancellationToken,
    ) -> Self {
        ConsumerSession {
            destination: processor.destination.clone(),
            connections: ConnectionManager::new(connector.clone(), cfg),
            layout: connector.dead_letter_layout(cfg),
            backoff: ExponentialBackoff::new(cfg.retry_delay, cfg.max_backoff),
            processor,
            token,
            state: ConsumerState::Disconnected,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Runs until the token is cancelled or a fatal error occurs.
    pub async fn run(mut self) -> Result<(), BrokerError> {
        info!("started consumer for: {}", self.destination);

        let result = loop {
            if self.token.is_cancelled() {
                break Ok(());
            }

            match self.session().await {
                Ok(()) => {}
                Err(BrokerError::Cancelled) => break Ok(()),
                Err(err) if err.is_fatal() => {
                    error!(error = err.to_string(), destination = self.destination, "consumer stopped");
                    break Err(err);
                }
                Err(err) => {
                    warn!(error = err.to_string(), destination = self.destination, "consumer disconnected");
                }
            }

            self.state = ConsumerState::Disconnected;
            self.connections.invalidate().await;

            let delay = self.backoff.next_delay();
            info!("reconnecting consumer for {} in {:?}", self.destination, delay);
            if backoff::sleep(&self.token, delay).await.is_err() {
                break Ok(());
            }
        };

        self.state = ConsumerState::Terminal;
        self.connections.invalidate().await;
        info!("stopping consumer for: {}", self.destination);
        result
    }

    /// One connected cycle: connect, provision, consume until the receiver closes.
    async fn session(&mut self) -> Result<(), BrokerError> {
        self.state = ConsumerState::Disconnected;
        let conn = self.connections.acquire(&self.token).await?;

        self.state = ConsumerState::Provisioning;
        let admin = conn.admin().await?;
        provisioner::ensure_destination(admin.as_ref(), &self.layout, &self.destination).await?;
        let mut receiver = conn.open_receiver(&self.destination).await?;

        self.state = ConsumerState::Consuming;
        self.backoff.reset();
        debug!("consuming from: {}", self.destination);

        loop {
            let batch = tokio::select! {
                _ = self.token.cancelled() => return Err(BrokerError::Cancelled),
                batch = receiver.next_batch() => batch?,
            };

            let Some(deliveries) = batch else {
                warn!("channel closed for: {}", self.destination);
                return Ok(());
            };

            for delivery in deliveries {
                self.processor.process(&self.token, delivery).await?;
            }
        }
    }
}

/// Handle to a running consumer loop.
pub struct SubscriptionHandle {
    destination: String,
    token: CancellationToken,
    join: JoinHandle<Result<(), BrokerError>>,
}

impl SubscriptionHandle {
    /// Spawns `session` on the tokio runtime.
    pub fn spawn<T, D, H>(session: ConsumerSession<T, D, H>) -> Self
    where
        T: Send + Sync + 'static,
        D: Decoder<T> + 'static,
        H: MessageHandler<T> + 'static,
    {
        let destination = session.destination.clone();
        let token = session.token.clone();
        let join = tokio::spawn(session.run());

        SubscriptionHandle {
            destination,
            token,
            join,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Stops the loop; it exits without further reconnect attempts.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the loop to exit and returns its terminal result.
    pub async fn join(self) -> Result<(), BrokerError> {
        match self.join.await {
            Ok(result) => result,
            Err(err) => {
                error!(error = err.to_string(), "consumer task error");
                Err(BrokerError::Consume {
                    destination: self.destination,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Cancels the loop and waits for it, up to `timeout`.
    pub async fn shutdown(self, timeout: Duration) -> Result<(), BrokerError> {
        self.cancel();
        let destination = self.destination.clone();
        match tokio::time::timeout(timeout, self.join()).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Consume {
                destination,
                reason: format!("consumer did not stop within {timeout:?}"),
            }),
        }
    }
}
