// src/rabbitmq/topology.rs
//! Exchange and queue declaration, binding and management.

use std::fmt;

use serde_json::{Map, Value};
use tracing::{debug, info};

use super::errors::Result;
use super::transport::{AmqpChannel, DeclaredQueue};
use crate::config::{keys, Properties};

/// Replaced by queue policies in RabbitMQ 3.0; brokers reject it as an argument.
pub const DEPRECATED_HA_POLICY: &str = "x-ha-policy";

/// Strips the deprecated `x-ha-policy` key and every null-valued key. Everything else,
/// `x-queue-master-locator` included, is kept verbatim.
pub fn normalize_arguments(arguments: &Map<String, Value>) -> Map<String, Value> {
    arguments
        .iter()
        .filter(|(key, value)| key.as_str() != DEPRECATED_HA_POLICY && !value.is_null())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Bind keys from the `routing` property: a single key or a list of keys.
pub fn routing_keys(properties: &Properties) -> Vec<String> {
    match properties.get(keys::ROUTING) {
        Some(Value::String(key)) => vec![key.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
    Custom(String),
}

impl ExchangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Custom(kind) => kind,
        }
    }
}

impl From<&str> for ExchangeKind {
    fn from(kind: &str) -> Self {
        match kind {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            other => ExchangeKind::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub arguments: Map<String, Value>,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            passive: false,
            durable: true,
            auto_delete: false,
            internal: false,
            no_wait: false,
            arguments: Map::new(),
        }
    }

    /// Fails with a configuration error when no exchange name is set.
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let name = properties.require_str(keys::EXCHANGE)?;
        let kind = properties.get_str(keys::EXCHANGE_TYPE).unwrap_or("topic");

        Ok(Self {
            name: name.to_string(),
            kind: ExchangeKind::from(kind),
            passive: properties.get_bool(keys::EXCHANGE_PASSIVE),
            durable: properties.get_bool(keys::EXCHANGE_DURABLE),
            auto_delete: properties.get_bool(keys::EXCHANGE_AUTO_DELETE),
            internal: properties.get_bool(keys::EXCHANGE_INTERNAL),
            no_wait: properties.get_bool(keys::EXCHANGE_NOWAIT),
            arguments: normalize_arguments(&properties.get_map(keys::EXCHANGE_PROPERTIES)),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    /// Empty asks the broker to generate a name.
    pub name: String,
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
    pub arguments: Map<String, Value>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: false,
            no_wait: false,
            arguments: Map::new(),
        }
    }

    pub fn from_properties(properties: &Properties) -> Self {
        Self {
            name: properties.get_str(keys::QUEUE).unwrap_or_default().to_string(),
            passive: properties.get_bool(keys::QUEUE_PASSIVE),
            durable: properties.get_bool(keys::QUEUE_DURABLE),
            exclusive: properties.get_bool(keys::QUEUE_EXCLUSIVE),
            auto_delete: properties.get_bool(keys::QUEUE_AUTO_DELETE),
            no_wait: properties.get_bool(keys::QUEUE_NOWAIT),
            arguments: normalize_arguments(&properties.get_map(keys::QUEUE_PROPERTIES)),
        }
    }
}

pub struct ExchangeManager<'a> {
    channel: &'a mut dyn AmqpChannel,
}

impl<'a> ExchangeManager<'a> {
    pub fn new(channel: &'a mut dyn AmqpChannel) -> Self {
        Self { channel }
    }

    /// Declares the exchange named by the `exchange` property.
    pub async fn declare(&mut self, properties: &Properties) -> Result<ExchangeSpec> {
        let spec = ExchangeSpec::from_properties(properties)?;
        debug!(exchange = %spec.name, kind = %spec.kind, durable = spec.durable, "Declaring exchange");
        self.channel.exchange_declare(&spec).await?;
        Ok(spec)
    }

    pub async fn delete(&mut self, exchange: &str, if_unused: bool) -> Result<()> {
        info!(exchange = %exchange, if_unused, "Deleting exchange");
        self.channel.exchange_delete(exchange, if_unused).await
    }

    pub async fn unbind(&mut self, destination: &str, source: &str, routing_key: &str) -> Result<()> {
        debug!(destination = %destination, source = %source, routing_key = %routing_key, "Unbinding exchange");
        self.channel.exchange_unbind(destination, source, routing_key).await
    }
}

pub struct QueueManager<'a> {
    channel: &'a mut dyn AmqpChannel,
}

impl<'a> QueueManager<'a> {
    pub fn new(channel: &'a mut dyn AmqpChannel) -> Self {
        Self { channel }
    }

    /// Declares the queue and binds it once per non-empty routing key.
    ///
    /// Does nothing and returns `None` unless a queue name is set or
    /// `queue_force_declare` is on, so publish-only sessions never create queues.
    pub async fn declare_and_bind(&mut self, properties: &Properties) -> Result<Option<DeclaredQueue>> {
        let spec = QueueSpec::from_properties(properties);
        if spec.name.is_empty() && !properties.get_bool(keys::QUEUE_FORCE_DECLARE) {
            return Ok(None);
        }

        let exchange = properties.require_str(keys::EXCHANGE)?;
        let declared = self.channel.queue_declare(&spec).await?;
        info!(
            queue = %declared.name,
            messages = declared.message_count,
            consumers = declared.consumer_count,
            "Queue declared"
        );

        for routing_key in routing_keys(properties) {
            if routing_key.is_empty() {
                continue;
            }
            debug!(queue = %declared.name, exchange = %exchange, routing_key = %routing_key, "Binding queue");
            self.channel
                .queue_bind(&declared.name, exchange, &routing_key)
                .await?;
        }

        Ok(Some(declared))
    }

    pub async fn purge(&mut self, queue: &str) -> Result<u32> {
        let purged = self.channel.queue_purge(queue).await?;
        info!(queue = %queue, purged, "Queue purged");
        Ok(purged)
    }

    pub async fn delete(&mut self, queue: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        let deleted = self.channel.queue_delete(queue, if_unused, if_empty).await?;
        info!(queue = %queue, deleted, "Queue deleted");
        Ok(deleted)
    }

    pub async fn unbind(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        debug!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Unbinding queue");
        self.channel.queue_unbind(queue, exchange, routing_key).await
    }
}
