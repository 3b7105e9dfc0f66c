// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client
//!
//! Entry point of the crate. `BrokerClient::connect` resolves the configuration, opens
//! the publisher connection and provisions the dead-letter destination before handing
//! out a client. If provisioning fails the connection is closed and the error returned.
//!
//! Every subscription owns its own connection and consumer loop, running on its own
//! tokio task; cancelling the client token stops all of them.
//!
//! ```no_run
//! use resilient_broker::{client::BrokerClient, config::BrokerSettings, middleware::Pipeline};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), resilient_broker::errors::BrokerError> {
//! let client = BrokerClient::amqp(BrokerSettings::from_env()?).await?;
//! let token = CancellationToken::new();
//! client
//!     .publish(&token, "orders", None, br#"{"id":1}"#, &Pipeline::new())
//!     .await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use crate::{
    config::{BrokerConfig, BrokerSettings},
    connection::ConnectionManager,
    consumer::{ConsumerSession, Decoder, JsonDecoder, MessageHandler, MessageProcessor, SubscriptionHandle},
    errors::BrokerError,
    message::Message,
    middleware::Pipeline,
    provisioner,
    publisher::Publisher,
    transport::Connector,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Resilient publish/subscribe client for one broker.
pub struct BrokerClient {
    cfg: BrokerConfig,
    connector: Arc<dyn Connector>,
    connections: Arc<ConnectionManager>,
    publisher: Publisher,
    token: CancellationToken,
}

impl BrokerClient {
    /// Connects through `connector` and provisions the dead-letter destination.
    ///
    /// # Parameters
    /// * `connector` - Broker adapter, e.g. `AmqpConnector` or `KafkaConnector`
    /// * `settings` - Caller settings merged onto the defaults
    ///
    /// # Returns
    /// * `Result<BrokerClient, BrokerError>` -
    ///   A ready client, or the connection/provisioning error. No connection is left
    ///   open on failure.
    ///
    /// # Example
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use resilient_broker::{client::BrokerClient, config::{BrokerConfig, BrokerSettings}, kafka::KafkaConnector};
    /// # async fn run() -> Result<(), resilient_broker::errors::BrokerError> {
    /// let settings = BrokerSettings::from_env()?;
    /// let cfg = BrokerConfig::resolve(settings.clone());
    /// let client = BrokerClient::connect(Arc::new(KafkaConnector::new(&cfg)), settings).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(
        connector: Arc<dyn Connector>,
        settings: BrokerSettings,
    ) -> Result<BrokerClient, BrokerError> {
        let cfg = BrokerConfig::resolve(settings);
        let layout = connector.dead_letter_layout(&cfg);

        let connections = Arc::new(ConnectionManager::new(connector.clone(), &cfg));
        let conn = connections.connect().await?;

        let provisioned = match conn.admin().await {
            Ok(admin) => provisioner::ensure_dead_letter(admin.as_ref(), &layout).await,
            Err(err) => Err(err),
        };
        if let Err(err) = provisioned {
            error!(error = err.to_string(), "failure to provision the dead letter destination");
            connections.invalidate().await;
            return Err(err);
        }
        debug!("dead letter destination ready: {}", layout.publish_target());

        let publisher = Publisher::new(connections.clone(), &cfg, layout.publish_target());

        info!("broker client {} connected", cfg.client_id);
        Ok(BrokerClient {
            cfg,
            connector,
            connections,
            publisher,
            token: CancellationToken::new(),
        })
    }

    /// Connects to an exchange/queue style broker.
    #[cfg(feature = "amqp")]
    pub async fn amqp(settings: BrokerSettings) -> Result<BrokerClient, BrokerError> {
        let cfg = BrokerConfig::resolve(settings.clone());
        Self::connect(Arc::new(crate::amqp::AmqpConnector::new(&cfg)), settings).await
    }

    /// Connects to a topic style broker.
    #[cfg(feature = "kafka")]
    pub async fn kafka(settings: BrokerSettings) -> Result<BrokerClient, BrokerError> {
        let cfg = BrokerConfig::resolve(settings.clone());
        Self::connect(Arc::new(crate::kafka::KafkaConnector::new(&cfg)), settings).await
    }

    /// Resolved configuration the client was built with.
    pub fn config(&self) -> &BrokerConfig {
        &self.cfg
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Publishes raw bytes. See `Publisher::publish` for the retry and dead-letter rules.
    pub async fn publish(
        &self,
        token: &CancellationToken,
        destination: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        pipeline: &Pipeline,
    ) -> Result<(), BrokerError> {
        self.publisher
            .publish(token, destination, key, payload, pipeline)
            .await
    }

    /// Serializes `body` as JSON and publishes it.
    pub async fn publish_json<T: Serialize + Sync>(
        &self,
        token: &CancellationToken,
        destination: &str,
        body: &T,
        pipeline: &Pipeline,
    ) -> Result<(), BrokerError> {
        self.publisher
            .publish_json(token, destination, body, pipeline)
            .await
    }

    /// Publishes a prebuilt message, keeping its key and headers.
    pub async fn publish_message(
        &self,
        token: &CancellationToken,
        message: Message,
        pipeline: &Pipeline,
    ) -> Result<(), BrokerError> {
        self.publisher.publish_message(token, message, pipeline).await
    }

    /// Starts a consumer loop for `destination` on its own task.
    ///
    /// Messages are decoded with `decoder` and, once the pipeline passes, handed to
    /// `handler`. The returned handle stops the loop and surfaces its terminal result.
    pub fn subscribe<T, D, H>(
        &self,
        destination: &str,
        decoder: D,
        handler: H,
        pipeline: Pipeline,
    ) -> SubscriptionHandle
    where
        T: Send + Sync + 'static,
        D: Decoder<T> + 'static,
        H: MessageHandler<T> + 'static,
    {
        let processor = MessageProcessor::new(destination, decoder, handler, pipeline, &self.cfg);
        let session = ConsumerSession::new(
            self.connector.clone(),
            &self.cfg,
            processor,
            self.token.child_token(),
        );

        SubscriptionHandle::spawn(session)
    }

    /// Subscribes with a JSON decoder for `T`.
    pub fn subscribe_json<T, H>(
        &self,
        destination: &str,
        handler: H,
        pipeline: Pipeline,
    ) -> SubscriptionHandle
    where
        T: DeserializeOwned + Send + Sync + 'static,
        H: MessageHandler<T> + 'static,
    {
        self.subscribe(destination, JsonDecoder::<T>::new(), handler, pipeline)
    }

    /// Stops every subscription and closes the publisher connection.
    pub async fn close(&self) {
        self.token.cancel();
        self.connections.invalidate().await;
        info!("broker client {} closed", self.cfg.client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        Admin, Connection, DeadLetterLayout, MockAdmin, MockConnection, MockConnector,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connector_with(admin: MockAdmin, closed: Arc<AtomicUsize>) -> MockConnector {
        let admin: Arc<dyn Admin> = Arc::new(admin);
        let mut connector = MockConnector::new();
        connector
            .expect_dead_letter_layout()
            .returning(|cfg| DeadLetterLayout::exchange(cfg));
        connector.expect_connect().times(1).returning(move || {
            let admin = admin.clone();
            let counter = closed.clone();
            let mut conn = MockConnection::new();
            conn.expect_is_closed().return_const(false);
            conn.expect_admin().returning(move || Ok(admin.clone()));
            conn.expect_close().returning(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(Arc::new(conn) as Arc<dyn Connection>)
        });
        connector
    }

    #[tokio::test]
    async fn should_close_connection_when_provisioning_fails() {
        let mut admin = MockAdmin::new();
        admin.expect_declare_destination().returning(|_| Ok(()));
        admin.expect_bind_dead_letter().returning(|q, e| {
            Err(BrokerError::BindDeadLetter {
                destination: q.to_owned(),
                dead_letter: e.to_owned(),
                reason: "access refused".into(),
            })
        });
        let closed = Arc::new(AtomicUsize::new(0));

        let result = BrokerClient::connect(
            Arc::new(connector_with(admin, closed.clone())),
            BrokerSettings::default(),
        )
        .await;

        assert!(matches!(result, Err(BrokerError::BindDeadLetter { .. })));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_dead_letter_to_queue_for_exchange_brokers() {
        let mut admin = MockAdmin::new();
        admin.expect_declare_destination().returning(|_| Ok(()));
        admin.expect_bind_dead_letter().returning(|_, _| Ok(()));

        let client = BrokerClient::connect(
            Arc::new(connector_with(admin, Arc::new(AtomicUsize::new(0)))),
            BrokerSettings {
                dead_letter_queue: Some("orders.dlq".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(client.publisher().dead_letter(), "orders.dlq");
        assert_eq!(client.config().dead_letter_queue, "orders.dlq");
    }
}
