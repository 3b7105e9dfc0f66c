// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Backoff Policies
//!
//! Three delay shapes are used by the client and they are intentionally kept apart:
//!
//! - `Backoff::Constant`: between publish attempts and inside the bounded reconnect loop
//!   of the connection manager.
//! - `Backoff::Linear`: between handler attempts in the consumer loop.
//! - `Backoff::Exponential` / `ExponentialBackoff`: between reconnect cycles of the
//!   consumer loop, doubling up to a ceiling.
//!
//! No jitter is applied, so delays are deterministic.

use crate::errors::BrokerError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stateless delay policy indexed by a 0-based attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Constant(Duration),
    Linear(Duration),
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    /// Delay to wait after the failure of attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Constant(base) => base,
            Backoff::Linear(base) => base.saturating_mul(attempt.saturating_add(1)),
            Backoff::Exponential { base, cap } => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(cap)
            }
        }
    }
}

/// Stateful exponential backoff owned by one consumer session.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let cap = cap.max(base);
        ExponentialBackoff {
            base,
            cap,
            current: base,
        }
    }

    /// Returns the delay to wait now and doubles the next one, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.cap);
        delay
    }

    /// Back to the base delay, after a successful reconnect.
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Sleeps for `duration` unless `token` fires first.
pub async fn sleep(token: &CancellationToken, duration: Duration) -> Result<(), BrokerError> {
    if token.is_cancelled() {
        return Err(BrokerError::Cancelled);
    }

    tokio::select! {
        _ = token.cancelled() => Err(BrokerError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
