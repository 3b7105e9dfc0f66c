// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod message;
pub mod middleware;
pub mod provisioner;
pub mod publisher;
pub mod transport;

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "kafka")]
pub mod kafka;
