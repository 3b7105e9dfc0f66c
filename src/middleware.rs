// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Middleware Pipeline
//!
//! Interceptors run, in registration order, before a message is sent by the publisher
//! or handed to a handler by the consumer loop. The first failure stops the chain and
//! is returned wrapped in `BrokerError::Middleware`, identifying the interceptor.
//!
//! Middlewares inspect the payload; they never get a mutable view of it.

use crate::errors::{BoxError, BrokerError};
use async_trait::async_trait;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An interceptor run before business logic.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name reported when this middleware rejects a message.
    fn name(&self) -> &str {
        "middleware"
    }

    async fn handle(
        &self,
        token: &CancellationToken,
        destination: &str,
        payload: &[u8],
    ) -> Result<(), BoxError>;
}

/// Ordered chain of middlewares.
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline::default()
    }

    /// Appends a middleware.
    pub fn with<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Appends an already shared middleware, e.g. one whose counters are read elsewhere.
    pub fn with_shared(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Runs every middleware in order, stopping at the first failure.
    pub async fn run(
        &self,
        token: &CancellationToken,
        destination: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        for (index, middleware) in self.middlewares.iter().enumerate() {
            if let Err(source) = middleware.handle(token, destination, payload).await {
                warn!(
                    destination = destination,
                    middleware = middleware.name(),
                    error = source.to_string(),
                    "middleware rejected message"
                );
                return Err(BrokerError::Middleware {
                    destination: destination.to_owned(),
                    index,
                    name: middleware.name().to_owned(),
                    source,
                });
            }
        }

        Ok(())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.middlewares.iter().map(|m| m.name()))
            .finish()
    }
}

/// Wraps a synchronous closure as a middleware.
pub fn middleware_fn<F>(name: &str, f: F) -> FnMiddleware<F>
where
    F: Fn(&CancellationToken, &str, &[u8]) -> Result<(), BoxError> + Send + Sync,
{
    FnMiddleware {
        name: name.to_owned(),
        f,
    }
}

pub struct FnMiddleware<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&CancellationToken, &str, &[u8]) -> Result<(), BoxError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        token: &CancellationToken,
        destination: &str,
        payload: &[u8],
    ) -> Result<(), BoxError> {
        (self.f)(token, destination, payload)
    }
}

/// Logs every message passing through the pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(
        &self,
        _token: &CancellationToken,
        destination: &str,
        payload: &[u8],
    ) -> Result<(), BoxError> {
        debug!(
            destination = destination,
            size = payload.len(),
            "processing message"
        );
        Ok(())
    }
}

/// Rejects messages once the caller's token is cancelled.
#[derive(Debug, Default, Clone, Copy)]
pub struct CancellationMiddleware;

#[async_trait]
impl Middleware for CancellationMiddleware {
    fn name(&self) -> &str {
        "cancellation"
    }

    async fn handle(
        &self,
        token: &CancellationToken,
        _destination: &str,
        _payload: &[u8],
    ) -> Result<(), BoxError> {
        if token.is_cancelled() {
            return Err(Box::new(BrokerError::Cancelled));
        }
        Ok(())
    }
}

/// Rejects payloads larger than `limit` bytes.
#[derive(Debug, Clone, Copy)]
pub struct MaxPayloadMiddleware {
    limit: usize,
}

impl MaxPayloadMiddleware {
    pub fn new(limit: usize) -> Self {
        MaxPayloadMiddleware { limit }
    }
}

#[async_trait]
impl Middleware for MaxPayloadMiddleware {
    fn name(&self) -> &str {
        "max-payload"
    }

    async fn handle(
        &self,
        _token: &CancellationToken,
        _destination: &str,
        payload: &[u8],
    ) -> Result<(), BoxError> {
        if payload.len() > self.limit {
            return Err(format!("payload of {} bytes exceeds limit of {}", payload.len(), self.limit).into());
        }
        Ok(())
    }
}

/// Counts messages and bytes. Share it with `Pipeline::with_shared` to read the counters.
#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    messages: AtomicU64,
    bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages: u64,
    pub bytes: u64,
}

impl MetricsMiddleware {
    pub fn new() -> Arc<Self> {
        Arc::new(MetricsMiddleware::default())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn handle(
        &self,
        _token: &CancellationToken,
        _destination: &str,
        payload: &[u8],
    ) -> Result<(), BoxError> {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}
