// src/amqp.rs
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::{keys, ConnectionConfig, Properties};
use crate::rabbitmq::{
    BatchManager, BatchOutcome, ConnectionManager, Connector, Consumer, ExchangeManager,
    LapinConnector, Message, MessageHandler, ProcedureRegistry, PublishResult, Publisher,
    QueueManager, Result, RpcServer, StopReason,
};

/// Property-driven entry point.
///
/// Every call merges its overrides on top of the base properties, opens its
/// own connection and channel, does its work and disconnects. Batched
/// messages live in this value until [`Amqp::batch_publish`] flushes them.
pub struct Amqp {
    properties: Properties,
    connector: Arc<dyn Connector>,
    batch: BatchManager,
}

impl Amqp {
    /// Talks to RabbitMQ over `lapin`.
    pub fn new(properties: Properties) -> Self {
        Self::with_connector(properties, Arc::new(LapinConnector))
    }

    pub fn with_connector(properties: Properties, connector: Arc<dyn Connector>) -> Self {
        Self {
            properties,
            connector,
            batch: BatchManager::new(),
        }
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    fn session(&self, overrides: &Map<String, Value>) -> Result<(Properties, ConnectionManager)> {
        let properties = self.properties.merged(overrides);
        let config = ConnectionConfig::from_properties(&properties)?;
        Ok((properties, ConnectionManager::new(config, self.connector.clone())))
    }

    /// Builds a message from a body and a flat property map.
    pub fn message(body: impl Into<Vec<u8>>, properties: &Map<String, Value>) -> Message {
        Message::from_properties(body, properties)
    }

    /// Publishes one message; `mandatory` comes from the merged properties.
    pub async fn publish(
        &self,
        routing: &str,
        message: &Message,
        overrides: &Map<String, Value>,
    ) -> Result<PublishResult> {
        let (properties, connection) = self.session(overrides)?;
        let mandatory = properties.get_bool(keys::MANDATORY);

        let mut publisher = Publisher::new(connection, properties);
        let result = publisher.publish(routing, message, mandatory).await;
        publisher.shutdown().await;
        result
    }

    /// Buffers a message for the next [`Amqp::batch_publish`].
    pub fn batch_basic_publish(&mut self, routing: impl Into<String>, message: Message) {
        self.batch.add(routing, message);
    }

    pub fn pending_batch(&self) -> usize {
        self.batch.len()
    }

    /// Flushes the buffered messages in one call. The buffer survives a failed flush.
    pub async fn batch_publish(&mut self, overrides: &Map<String, Value>) -> Result<BatchOutcome> {
        let (properties, connection) = self.session(overrides)?;

        let mut publisher = Publisher::new(connection, properties);
        let result = publisher.batch_publish(&mut self.batch).await;
        publisher.shutdown().await;
        result
    }

    pub async fn consume<H>(
        &self,
        queue: &str,
        handler: &mut H,
        overrides: &Map<String, Value>,
    ) -> Result<StopReason>
    where
        H: MessageHandler + ?Sized,
    {
        let (properties, connection) = self.session(overrides)?;

        let mut consumer = Consumer::new(connection, properties);
        let result = consumer.consume(queue, handler).await;
        consumer.shutdown().await;
        result
    }

    /// Answers RPC requests on `queue` with the procedures in `registry`.
    pub async fn serve_rpc(
        &self,
        queue: &str,
        registry: ProcedureRegistry,
        overrides: &Map<String, Value>,
    ) -> Result<StopReason> {
        let (properties, connection) = self.session(overrides)?;

        let mut server = RpcServer::new(Consumer::new(connection, properties), registry);
        let result = server.serve(queue).await;
        server.shutdown().await;
        result
    }

    pub async fn queue_purge(&self, queue: &str, overrides: &Map<String, Value>) -> Result<u32> {
        let (_, mut connection) = self.session(overrides)?;
        let result = async { QueueManager::new(connection.channel().await?).purge(queue).await }.await;
        connection.disconnect().await;
        result
    }

    pub async fn queue_delete(
        &self,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
        overrides: &Map<String, Value>,
    ) -> Result<u32> {
        let (_, mut connection) = self.session(overrides)?;
        let result = async {
            QueueManager::new(connection.channel().await?)
                .delete(queue, if_unused, if_empty)
                .await
        }
        .await;
        connection.disconnect().await;
        result
    }

    pub async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        overrides: &Map<String, Value>,
    ) -> Result<()> {
        let (_, mut connection) = self.session(overrides)?;
        let result = async {
            QueueManager::new(connection.channel().await?)
                .unbind(queue, exchange, routing_key)
                .await
        }
        .await;
        connection.disconnect().await;
        result
    }

    pub async fn exchange_delete(
        &self,
        exchange: &str,
        if_unused: bool,
        overrides: &Map<String, Value>,
    ) -> Result<()> {
        let (_, mut connection) = self.session(overrides)?;
        let result = async {
            ExchangeManager::new(connection.channel().await?)
                .delete(exchange, if_unused)
                .await
        }
        .await;
        connection.disconnect().await;
        result
    }

    pub async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        overrides: &Map<String, Value>,
    ) -> Result<()> {
        let (_, mut connection) = self.session(overrides)?;
        let result = async {
            ExchangeManager::new(connection.channel().await?)
                .unbind(destination, source, routing_key)
                .await
        }
        .await;
        connection.disconnect().await;
        result
    }
}
