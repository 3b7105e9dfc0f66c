// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Client
//!
//! This module provides the error taxonomy shared by both broker adapters and the
//! resilience core. The `BrokerError` enum separates transient transport faults,
//! malformed messages, middleware rejections, handler failures, provisioning failures
//! and exhausted publish retries, so callers can decide what to do with each class
//! without re-deriving state.

use thiserror::Error;

/// Boxed error returned by user supplied middlewares, handlers and decoders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Represents errors that can occur while publishing, consuming or provisioning.
///
/// Each variant carries enough context (destination name, attempt count) to diagnose
/// a failure from the error alone.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    Connection(String),

    /// Error opening a channel, sender or receiver on an established connection
    #[error("failure to create a channel: {0}")]
    Channel(String),

    /// The connection manager is replacing its connection
    #[error("connection is reconnecting")]
    Reconnecting,

    /// The bounded reconnect loop gave up
    #[error("failure to reconnect after {attempts} attempts")]
    Reconnect {
        attempts: u32,
        #[source]
        source: Box<BrokerError>,
    },

    /// Error declaring a destination (topic, exchange or queue)
    #[error("failure to declare destination `{name}`: {reason}")]
    DeclareDestination { name: String, reason: String },

    /// The destination already exists; only the provisioner swallows this
    #[error("destination `{0}` already exists")]
    AlreadyExists(String),

    /// Error binding a destination to its dead letter
    #[error("failure to bind `{destination}` to dead letter `{dead_letter}`: {reason}")]
    BindDeadLetter {
        destination: String,
        dead_letter: String,
        reason: String,
    },

    /// A single delivery attempt failed
    #[error("failure to publish to `{destination}`: {reason}")]
    Publishing { destination: String, reason: String },

    /// Publish retries were exhausted and the message was dead lettered
    #[error("failure to publish to `{destination}` after {attempts} attempts, message was dead lettered")]
    DeadLettered {
        destination: String,
        attempts: u32,
        #[source]
        source: Box<BrokerError>,
    },

    /// Publish retries were exhausted and the dead letter delivery failed too
    #[error("failure to publish to `{destination}` after {attempts} attempts: {source}; dead letter delivery failed: {dead_letter}")]
    DeadLetterFailed {
        destination: String,
        attempts: u32,
        source: Box<BrokerError>,
        dead_letter: Box<BrokerError>,
    },

    /// A middleware rejected the message
    #[error("middleware #{index} `{name}` rejected message for `{destination}`")]
    Middleware {
        destination: String,
        index: usize,
        name: String,
        #[source]
        source: BoxError,
    },

    /// The payload could not be decoded into the subscriber's type
    #[error("failure to decode payload from `{destination}`")]
    Decode {
        destination: String,
        #[source]
        source: BoxError,
    },

    /// The payload could not be encoded before publishing
    #[error("failure to serialize payload for `{destination}`")]
    Serialization {
        destination: String,
        #[source]
        source: serde_json::Error,
    },

    /// The handler failed every attempt
    #[error("handler failed for `{destination}` after {attempts} attempts")]
    Handler {
        destination: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },

    /// Error receiving from a destination
    #[error("failure to consume from `{destination}`: {reason}")]
    Consume { destination: String, reason: String },

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    Ack(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    Nack(String),

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid or unusable configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BrokerError {
    /// Errors that no amount of reconnecting will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Config(_))
    }

    /// Transport faults worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_)
                | BrokerError::Channel(_)
                | BrokerError::Reconnecting
                | BrokerError::Reconnect { .. }
                | BrokerError::Publishing { .. }
                | BrokerError::Consume { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_classify_errors() {
        assert!(BrokerError::Config("bad".into()).is_fatal());
        assert!(!BrokerError::Connection("down".into()).is_fatal());
        assert!(BrokerError::Connection("down".into()).is_retryable());
        assert!(!BrokerError::Cancelled.is_retryable());
        assert!(!BrokerError::AlreadyExists("dlq".into()).is_retryable());
    }

    #[test]
    fn should_describe_both_failures_when_dead_letter_fails() {
        let err = BrokerError::DeadLetterFailed {
            destination: "orders".into(),
            attempts: 2,
            source: Box::new(BrokerError::Publishing {
                destination: "orders".into(),
                reason: "timeout".into(),
            }),
            dead_letter: Box::new(BrokerError::Publishing {
                destination: "dlq.topic".into(),
                reason: "broker down".into(),
            }),
        };

        let msg = err.to_string();
        assert!(msg.contains("timeout"));
        assert!(msg.contains("broker down"));
        assert!(msg.contains("2 attempts"));
    }
}
