// src/rabbitmq/transport.rs
//! The AMQP client primitive the core drives.
//!
//! Everything above this module talks to a broker exclusively through these
//! traits. [`LapinConnector`](super::LapinConnector) speaks to RabbitMQ,
//! [`MemoryBroker`](super::MemoryBroker) keeps the whole broker in-process.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::batch::BatchItem;
use super::errors::Result;
use super::message::{Delivery, Message};
use super::topology::{ExchangeSpec, QueueSpec};
use crate::config::ConnectionConfig;

/// Result of a queue declaration: the resolved name plus a point-in-time depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
}

/// A mandatory message the broker could not route.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmEvent {
    Ack { delivery_tag: u64 },
    Nack { delivery_tag: u64 },
    Return(ReturnedMessage),
}

/// Everything that resolved during one `wait_for_confirms` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfirmWait {
    pub events: Vec<ConfirmEvent>,
    /// Publishes still unconfirmed when the timeout elapsed.
    pub outstanding: usize,
}

/// Most confirm events a channel holds between two waits.
pub const CONFIRM_BACKLOG_LIMIT: usize = 4096;

/// Confirm events resolved since the last `wait_for_confirms`.
///
/// Nacks and returns are always kept. Past [`CONFIRM_BACKLOG_LIMIT`] the
/// oldest acks are dropped, which only loses their `on_ack` callbacks.
#[derive(Debug, Default)]
pub struct ConfirmBacklog {
    events: VecDeque<ConfirmEvent>,
    dropped_acks: usize,
}

impl ConfirmBacklog {
    pub fn push(&mut self, event: ConfirmEvent) {
        if self.events.len() >= CONFIRM_BACKLOG_LIMIT {
            let oldest_ack = self
                .events
                .iter()
                .position(|event| matches!(event, ConfirmEvent::Ack { .. }));
            if let Some(index) = oldest_ack {
                self.events.remove(index);
                self.dropped_acks += 1;
            }
        }
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Hands over everything held so far and starts over.
    pub fn take(&mut self) -> Vec<ConfirmEvent> {
        if self.dropped_acks > 0 {
            warn!(dropped = self.dropped_acks, "Confirm backlog overflowed, oldest acks dropped");
            self.dropped_acks = 0;
        }
        self.events.drain(..).collect()
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn AmqpConnection>>;
}

#[async_trait]
pub trait AmqpConnection: Send {
    async fn create_channel(&mut self) -> Result<Box<dyn AmqpChannel>>;

    fn is_open(&self) -> bool;

    async fn close(&mut self) -> Result<()>;
}

/// One AMQP channel. Never shared: every method takes `&mut self`.
#[async_trait]
pub trait AmqpChannel: Send {
    async fn exchange_declare(&mut self, exchange: &ExchangeSpec) -> Result<()>;

    async fn queue_declare(&mut self, queue: &QueueSpec) -> Result<DeclaredQueue>;

    async fn queue_bind(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn queue_unbind(&mut self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<()>;

    /// Returns the number of messages removed.
    async fn queue_purge(&mut self, queue: &str) -> Result<u32>;

    /// Returns the number of messages deleted along with the queue.
    async fn queue_delete(&mut self, queue: &str, if_unused: bool, if_empty: bool) -> Result<u32>;

    async fn exchange_delete(&mut self, exchange: &str, if_unused: bool) -> Result<()>;

    async fn exchange_unbind(
        &mut self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<()>;

    /// Puts the channel in confirm mode. Calling it twice is harmless.
    async fn confirm_select(&mut self) -> Result<()>;

    async fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: &Message,
    ) -> Result<()>;

    /// Publishes every item, in order, as one flush.
    async fn publish_batch(&mut self, exchange: &str, items: &[BatchItem]) -> Result<()>;

    /// Blocks until every pending confirm has resolved or `timeout` elapses.
    async fn wait_for_confirms(&mut self, timeout: Duration) -> Result<ConfirmWait>;

    async fn basic_qos(&mut self, prefetch_size: u32, prefetch_count: u16, global: bool)
        -> Result<()>;

    /// Starts a subscription and returns its consumer tag.
    async fn basic_consume(&mut self, queue: &str, options: &ConsumeOptions) -> Result<String>;

    async fn basic_cancel(&mut self, consumer_tag: &str) -> Result<()>;

    /// Whether any subscription is still registered on this channel.
    fn has_consumers(&self) -> bool;

    /// Waits for the next delivery. `None` as timeout waits forever; `Ok(None)` means the wait timed out.
    async fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Delivery>>;

    async fn basic_ack(&mut self, delivery_tag: u64) -> Result<()>;

    async fn basic_reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<()>;

    fn is_open(&self) -> bool;

    async fn close(&mut self) -> Result<()>;
}
