// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! The `ConnectionManager` owns one broker connection handle. It opens the connection
//! through a `Connector`, detects when it is closed, and reconnects with a bounded
//! number of attempts separated by the constant retry delay.
//!
//! The handle sits behind a `RwLock`: while a reconnect is in progress, readers see a
//! clean `BrokerError::Reconnecting` instead of a half replaced handle.

use crate::{
    backoff::{self, Backoff},
    config::BrokerConfig,
    errors::BrokerError,
    transport::{Connection, Connector},
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

enum ConnectionState {
    Disconnected,
    Reconnecting,
    Connected(Arc<dyn Connection>),
}

/// Owner of one broker connection handle, replaced on failure.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    max_retries: u32,
    backoff: Backoff,
    state: RwLock<ConnectionState>,
    generation: AtomicU64,
}

impl ConnectionManager {
    /// Creates a new, disconnected manager.
    ///
    /// # Parameters
    /// * `connector` - Broker specific connection factory
    /// * `cfg` - Resolved configuration; `max_retries` and `retry_delay` bound reconnects
    ///
    /// # Returns
    /// A manager in the disconnected state; call `connect` or `acquire` to open it
    pub fn new(connector: Arc<dyn Connector>, cfg: &BrokerConfig) -> Self {
        ConnectionManager {
            connector,
            max_retries: cfg.max_retries,
            backoff: Backoff::Constant(cfg.retry_delay),
            state: RwLock::new(ConnectionState::Disconnected),
            generation: AtomicU64::new(0),
        }
    }

    /// Opens a new connection and makes it current.
    pub async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        debug!("creating broker connection...");
        let conn = self.connector.connect().await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            err
        })?;

        *self.state.write().await = ConnectionState::Connected(conn.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        debug!("broker connected");

        Ok(conn)
    }

    /// Replaces the current connection, trying up to `max_retries` times.
    ///
    /// The constant retry delay separates attempts. At least one attempt is always made.
    pub async fn reconnect(&self, token: &CancellationToken) -> Result<Arc<dyn Connection>, BrokerError> {
        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, ConnectionState::Reconnecting)
        };
        if let ConnectionState::Connected(conn) = previous {
            close_quietly(conn.as_ref()).await;
        }

        let attempts = self.max_retries.max(1);
        let mut last_err = BrokerError::Connection("no attempt made".to_owned());

        for attempt in 0..attempts {
            if token.is_cancelled() {
                self.mark_disconnected().await;
                return Err(BrokerError::Cancelled);
            }

            match self.connector.connect().await {
                Ok(conn) => {
                    *self.state.write().await = ConnectionState::Connected(conn.clone());
                    self.generation.fetch_add(1, Ordering::AcqRel);
                    debug!(attempt = attempt + 1, "broker reconnected");
                    return Ok(conn);
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        attempt = attempt + 1,
                        max = attempts,
                        "reconnect attempt failed"
                    );
                    last_err = err;
                }
            }

            if attempt + 1 < attempts {
                if let Err(err) = backoff::sleep(token, self.backoff.delay(attempt)).await {
                    self.mark_disconnected().await;
                    return Err(err);
                }
            }
        }

        self.mark_disconnected().await;
        Err(BrokerError::Reconnect {
            attempts,
            source: Box::new(last_err),
        })
    }

    /// Replaces a missing or closed connection with a single connect attempt.
    ///
    /// The check and the switch to the reconnecting state happen under one write lock,
    /// so concurrent callers never open two connections: a caller arriving while the
    /// replacement is in flight gets `BrokerError::Reconnecting`, and a caller arriving
    /// after it gets the new handle. The replaced handle is closed.
    pub async fn refresh(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        let previous = {
            let mut state = self.state.write().await;
            match &*state {
                ConnectionState::Connected(conn) if !conn.is_closed() => return Ok(conn.clone()),
                ConnectionState::Reconnecting => return Err(BrokerError::Reconnecting),
                _ => {}
            }
            std::mem::replace(&mut *state, ConnectionState::Reconnecting)
        };
        if let ConnectionState::Connected(conn) = previous {
            close_quietly(conn.as_ref()).await;
        }

        match self.connector.connect().await {
            Ok(conn) => {
                *self.state.write().await = ConnectionState::Connected(conn.clone());
                self.generation.fetch_add(1, Ordering::AcqRel);
                debug!("broker connection refreshed");
                Ok(conn)
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to refresh connection");
                self.mark_disconnected().await;
                Err(err)
            }
        }
    }

    /// Returns the live connection, reconnecting when it is missing or closed.
    pub async fn acquire(&self, token: &CancellationToken) -> Result<Arc<dyn Connection>, BrokerError> {
        match self.current().await {
            Ok(conn) => Ok(conn),
            Err(_) => self.reconnect(token).await,
        }
    }

    /// Returns the live connection without reconnecting.
    pub async fn current(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        match &*self.state.read().await {
            ConnectionState::Connected(conn) if !conn.is_closed() => Ok(conn.clone()),
            ConnectionState::Connected(_) | ConnectionState::Disconnected => {
                Err(BrokerError::Connection("connection closed".to_owned()))
            }
            ConnectionState::Reconnecting => Err(BrokerError::Reconnecting),
        }
    }

    /// Closes and forgets the current connection.
    pub async fn invalidate(&self) {
        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, ConnectionState::Disconnected)
        };
        if let ConnectionState::Connected(conn) = previous {
            close_quietly(conn.as_ref()).await;
        }
    }

    /// Incremented every time a new connection becomes current.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    async fn mark_disconnected(&self) {
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

async fn close_quietly(conn: &dyn Connection) {
    if conn.is_closed() {
        return;
    }
    if let Err(err) = conn.close().await {
        warn!(error = err.to_string(), "error closing connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockConnection, MockConnector};
    use std::{
        sync::atomic::{AtomicU32, AtomicUsize},
        time::Duration,
    };
    use tokio::time::Instant;

    fn config(max_retries: u32) -> BrokerConfig {
        BrokerConfig {
            max_retries,
            retry_delay: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn live_connection() -> Arc<dyn Connection> {
        let mut conn = MockConnection::new();
        conn.expect_is_closed().return_const(false);
        conn.expect_close().returning(|| Ok(()));
        Arc::new(conn)
    }

    #[tokio::test]
    async fn should_report_disconnected_before_connect() {
        let connector = MockConnector::new();
        let manager = ConnectionManager::new(Arc::new(connector), &config(3));

        assert!(matches!(manager.current().await, Err(BrokerError::Connection(_))));
        assert_eq!(manager.generation(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_reconnect_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut connector = MockConnector::new();
        let counter = calls.clone();
        connector.expect_connect().times(3).returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BrokerError::Connection("refused".into()))
            } else {
                Ok(live_connection())
            }
        });

        let manager = ConnectionManager::new(Arc::new(connector), &config(5));
        let start = Instant::now();

        manager.reconnect(&CancellationToken::new()).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(manager.generation(), 1);
        assert!(manager.current().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn should_give_up_after_max_retries() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(3)
            .returning(|| Err(BrokerError::Connection("refused".into())));

        let manager = ConnectionManager::new(Arc::new(connector), &config(3));

        let err = manager
            .reconnect(&CancellationToken::new())
            .await
            .err()
            .expect("reconnect should fail");

        assert!(matches!(err, BrokerError::Reconnect { attempts: 3, .. }));
        assert!(matches!(manager.current().await, Err(BrokerError::Connection(_))));
    }

    #[tokio::test]
    async fn should_close_previous_connection_on_invalidate() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut conn = MockConnection::new();
        conn.expect_is_closed().return_const(false);
        let counter = closed.clone();
        conn.expect_close().times(1).returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let conn: Arc<dyn Connection> = Arc::new(conn);

        let mut connector = MockConnector::new();
        connector.expect_connect().times(1).returning(move || Ok(conn.clone()));

        let manager = ConnectionManager::new(Arc::new(connector), &config(1));
        manager.connect().await.unwrap();
        manager.invalidate().await;

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(manager.current().await.is_err());
    }

    #[tokio::test]
    async fn should_not_retry_when_cancelled() {
        let mut connector = MockConnector::new();
        connector.expect_connect().never();

        let manager = ConnectionManager::new(Arc::new(connector), &config(3));
        let token = CancellationToken::new();
        token.cancel();

        assert!(matches!(
            manager.reconnect(&token).await,
            Err(BrokerError::Cancelled)
        ));
    }
    #[tokio::test(start_paused = true)]
    async fn should_report_reconnecting_while_handle_is_replaced() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut connector = MockConnector::new();
        let counter = calls.clone();
        connector.expect_connect().times(2).returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(BrokerError::Connection("refused".into()))
            } else {
                Ok(live_connection())
            }
        });

        let manager = Arc::new(ConnectionManager::new(Arc::new(connector), &config(3)));
        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.reconnect(&CancellationToken::new()).await.is_ok() })
        };

        // first attempt failed, the task now sleeps in the 5s constant backoff
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(manager.current().await, Err(BrokerError::Reconnecting)));
        assert_eq!(manager.generation(), 0);

        assert!(task.await.unwrap());
        assert_eq!(manager.generation(), 1);
        assert!(manager.current().await.is_ok());
    }

    #[tokio::test]
    async fn should_open_one_connection_for_concurrent_refreshes() {
        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = dropped.clone();
        let mut stale = MockConnection::new();
        stale
            .expect_is_closed()
            .returning(move || flag.load(Ordering::SeqCst));
        stale.expect_close().returning(|| Ok(()));
        let stale: Arc<dyn Connection> = Arc::new(stale);

        let mut connector = MockConnector::new();
        let mut first = Some(stale);
        connector.expect_connect().times(2).returning(move || match first.take() {
            Some(conn) => Ok(conn),
            None => Ok(live_connection()),
        });

        let manager = ConnectionManager::new(Arc::new(connector), &config(1));
        manager.connect().await.unwrap();
        dropped.store(true, Ordering::SeqCst);

        let (a, b) = tokio::join!(manager.refresh(), manager.refresh());

        assert!(a.is_ok());
        assert!(b.is_ok() || matches!(b, Err(BrokerError::Reconnecting)));
        assert_eq!(manager.generation(), 2);
        assert!(manager.current().await.is_ok());
    }

    #[tokio::test]
    async fn should_keep_live_connection_on_refresh() {
        let mut connector = MockConnector::new();
        connector.expect_connect().times(1).returning(|| Ok(live_connection()));

        let manager = ConnectionManager::new(Arc::new(connector), &config(1));
        manager.connect().await.unwrap();
        manager.refresh().await.unwrap();

        assert_eq!(manager.generation(), 1);
    }
}
