// src/rabbitmq/consumer.rs
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::ConnectionManager;
use super::errors::{AmqpError, Result};
use super::message::{Delivery, Message};
use super::topology::{ExchangeManager, QueueManager};
use super::transport::{AmqpChannel, ConsumeOptions};
use crate::config::{keys, Properties};

/// What the delivery loop does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeFlow {
    Continue,
    Stop,
}

/// Why a `consume` call returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The queue was empty at declare time and the session is not persistent.
    EmptyQueue,
    /// A handler asked to stop, usually through `stop_when_processed`.
    Processed,
    /// No delivery arrived within the configured timeout.
    IdleTimeout,
    /// The subscription was cancelled, e.g. by acknowledging the shutdown sentinel.
    Cancelled,
}

#[async_trait]
pub trait MessageHandler: Send {
    async fn handle(
        &mut self,
        delivery: Delivery,
        session: &mut ConsumerSession<'_>,
    ) -> Result<ConsumeFlow>;
}

/// Handle given to a [`MessageHandler`] for the lifetime of one `consume` call.
pub struct ConsumerSession<'a> {
    channel: &'a mut dyn AmqpChannel,
    queue: String,
    consumer_tag: String,
    initial_count: u32,
    remaining: u32,
    no_ack: bool,
    shutdown_sentinel: String,
}

impl<'a> ConsumerSession<'a> {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Queue depth captured when the queue was declared. Never refreshed.
    pub fn initial_count(&self) -> u32 {
        self.initial_count
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Acks the delivery. A body equal to the shutdown sentinel also cancels the subscription.
    pub async fn acknowledge(&mut self, delivery: &Delivery) -> Result<()> {
        if self.no_ack {
            debug!(delivery_tag = delivery.delivery_tag, "Auto-ack consumer, skipping ack");
        } else {
            self.channel.basic_ack(delivery.delivery_tag).await?;
        }

        if delivery.body() == self.shutdown_sentinel.as_bytes() {
            info!(consumer_tag = %self.consumer_tag, "Shutdown message received, cancelling consumer");
            self.channel.basic_cancel(&self.consumer_tag).await?;
        }
        Ok(())
    }

    pub async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery.delivery_tag, requeue)
            .await
    }

    /// Counts one message as processed and asks to stop once the count hits zero.
    pub fn stop_when_processed(&mut self) -> ConsumeFlow {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            ConsumeFlow::Stop
        } else {
            ConsumeFlow::Continue
        }
    }

    /// Publishes on the session's own channel.
    pub async fn publish(&mut self, exchange: &str, routing_key: &str, message: &Message) -> Result<()> {
        self.channel
            .basic_publish(exchange, routing_key, false, message)
            .await
    }
}

pub struct Consumer {
    connection: ConnectionManager,
    properties: Properties,
}

impl Consumer {
    pub fn new(connection: ConnectionManager, properties: Properties) -> Self {
        Self {
            connection,
            properties,
        }
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    fn idle_timeout(&self) -> Option<Duration> {
        let secs: f64 = self.properties.get_or(keys::TIMEOUT, 0.0);
        // Too large to represent means no deadline at all.
        (secs > 0.0)
            .then(|| Duration::try_from_secs_f64(secs).ok())
            .flatten()
    }

    fn consume_options(&self) -> ConsumeOptions {
        let consumer_tag = match self.properties.get_str(keys::CONSUMER_TAG) {
            Some(tag) if !tag.is_empty() => tag.to_string(),
            _ => format!("consumer-{}", Uuid::new_v4()),
        };
        ConsumeOptions {
            consumer_tag,
            no_local: self.properties.get_bool(keys::CONSUMER_NO_LOCAL),
            no_ack: self.properties.get_bool(keys::CONSUMER_NO_ACK),
            exclusive: self.properties.get_bool(keys::CONSUMER_EXCLUSIVE),
            no_wait: self.properties.get_bool(keys::CONSUMER_NOWAIT),
        }
    }

    /// Declares `queue`, subscribes to it and feeds every delivery to `handler`
    /// until one of the [`StopReason`]s applies. Transport and handler errors
    /// end the loop with an error.
    pub async fn consume<H>(&mut self, queue: &str, handler: &mut H) -> Result<StopReason>
    where
        H: MessageHandler + ?Sized,
    {
        let mut properties = self.properties.clone();
        properties.set(keys::QUEUE, queue);
        properties.require_str(keys::EXCHANGE)?;

        let options = self.consume_options();
        let timeout = self.idle_timeout();
        let persistent = properties.get_bool(keys::PERSISTENT);
        let shutdown_sentinel = properties
            .get_str(keys::SHUTDOWN_SENTINEL)
            .unwrap_or("quit")
            .to_string();

        let channel = self.connection.channel().await?;
        ExchangeManager::new(&mut *channel)
            .declare(&properties)
            .await?;
        let declared = QueueManager::new(&mut *channel)
            .declare_and_bind(&properties)
            .await?
            .ok_or_else(|| AmqpError::configuration("consume requires a queue name"))?;

        if declared.message_count == 0 && !persistent {
            info!(queue = %declared.name, "Queue is empty, nothing to consume");
            return Ok(StopReason::EmptyQueue);
        }

        if properties.get_bool(keys::QOS) {
            let prefetch_size = properties.get_or(keys::QOS_PREFETCH_SIZE, 0u32);
            let prefetch_count = properties.get_or(keys::QOS_PREFETCH_COUNT, 1u16);
            let global = properties.get_bool(keys::QOS_GLOBAL);
            debug!(prefetch_size, prefetch_count, global, "Applying QoS");
            channel.basic_qos(prefetch_size, prefetch_count, global).await?;
        }

        let consumer_tag = channel.basic_consume(&declared.name, &options).await?;
        info!(queue = %declared.name, consumer_tag = %consumer_tag, "Started consuming");

        let mut session = ConsumerSession {
            channel,
            queue: declared.name,
            consumer_tag,
            initial_count: declared.message_count,
            remaining: declared.message_count,
            no_ack: options.no_ack,
            shutdown_sentinel,
        };

        let outcome = async {
            loop {
                if !session.channel.has_consumers() {
                    return Ok::<_, AmqpError>(StopReason::Cancelled);
                }

                match session.channel.wait(timeout).await? {
                    Some(delivery) => {
                        debug!(
                            queue = %session.queue,
                            delivery_tag = delivery.delivery_tag,
                            redelivered = delivery.redelivered,
                            "Delivery received"
                        );
                        if handler.handle(delivery, &mut session).await? == ConsumeFlow::Stop {
                            return Ok(StopReason::Processed);
                        }
                    }
                    None if session.channel.has_consumers() => return Ok(StopReason::IdleTimeout),
                    None => return Ok(StopReason::Cancelled),
                }
            }
        }
        .await;

        // The subscription ends with the session, whichever way the loop exited.
        if session.channel.has_consumers() {
            if let Err(err) = session.channel.basic_cancel(&session.consumer_tag).await {
                warn!(consumer_tag = %session.consumer_tag, "Failed to cancel consumer: {}", err);
            }
        }

        match &outcome {
            Ok(reason) => info!(queue = %session.queue, reason = ?reason, "Stopped consuming"),
            Err(err) => warn!(queue = %session.queue, "Consuming failed: {}", err),
        }
        outcome
    }

    pub async fn shutdown(&mut self) {
        self.connection.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::rabbitmq::{BrokerCall, MemoryBroker};
    use std::sync::Arc;

    fn consumer(broker: &MemoryBroker, properties: Properties) -> Consumer {
        let config = ConnectionConfig::from_properties(&properties).unwrap();
        Consumer::new(
            ConnectionManager::new(config, Arc::new(broker.clone())),
            properties,
        )
    }

    /// Acks everything and stops once the initial count is drained.
    #[derive(Default)]
    struct Drain {
        bodies: Vec<String>,
    }

    #[async_trait]
    impl MessageHandler for Drain {
        async fn handle(
            &mut self,
            delivery: Delivery,
            session: &mut ConsumerSession<'_>,
        ) -> Result<ConsumeFlow> {
            self.bodies
                .push(delivery.message.body_str().unwrap_or_default().to_string());
            session.acknowledge(&delivery).await?;
            Ok(session.stop_when_processed())
        }
    }

    /// Acks everything and never asks to stop.
    struct AckAll {
        seen: usize,
    }

    #[async_trait]
    impl MessageHandler for AckAll {
        async fn handle(
            &mut self,
            delivery: Delivery,
            session: &mut ConsumerSession<'_>,
        ) -> Result<ConsumeFlow> {
            self.seen += 1;
            session.acknowledge(&delivery).await?;
            Ok(ConsumeFlow::Continue)
        }
    }

    #[tokio::test]
    async fn empty_queue_returns_immediately() {
        let broker = MemoryBroker::new();
        broker.declare_queue("jobs");
        let mut consumer = consumer(&broker, Properties::new());
        let mut handler = Drain::default();

        let reason = consumer.consume("jobs", &mut handler).await.unwrap();

        assert_eq!(reason, StopReason::EmptyQueue);
        assert!(handler.bodies.is_empty());
        assert!(!broker
            .calls()
            .iter()
            .any(|call| matches!(call, BrokerCall::Consume { .. })));
    }

    #[tokio::test]
    async fn stops_after_initial_count_is_processed() {
        let broker = MemoryBroker::new();
        for body in ["one", "two", "three"] {
            broker.enqueue("jobs", Message::new(body));
        }
        let mut consumer = consumer(&broker, Properties::new());
        let mut handler = Drain::default();

        let reason = consumer.consume("jobs", &mut handler).await.unwrap();

        assert_eq!(reason, StopReason::Processed);
        assert_eq!(handler.bodies, vec!["one", "two", "three"]);
        assert_eq!(broker.queue_depth("jobs"), Some(0));
    }

    #[tokio::test]
    async fn sentinel_ack_cancels_the_subscription() {
        let broker = MemoryBroker::new();
        for body in ["a", "quit", "b"] {
            broker.enqueue("jobs", Message::new(body));
        }
        let mut props = Properties::new();
        props.set("consumer_tag", "worker-1");
        let mut consumer = consumer(&broker, props);
        let mut handler = AckAll { seen: 0 };

        let reason = consumer.consume("jobs", &mut handler).await.unwrap();

        assert_eq!(reason, StopReason::Cancelled);
        assert_eq!(handler.seen, 2);
        assert_eq!(broker.queue_depth("jobs"), Some(1));
        assert!(broker.calls().contains(&BrokerCall::Cancel {
            consumer_tag: "worker-1".to_string()
        }));
    }

    #[tokio::test]
    async fn persistent_consumer_times_out_when_idle() {
        let broker = MemoryBroker::new();
        broker.declare_queue("jobs");
        let mut props = Properties::new();
        props.set("persistent", true);
        props.set("timeout", 0.05);
        let mut consumer = consumer(&broker, props);
        let mut handler = AckAll { seen: 0 };

        let reason = consumer.consume("jobs", &mut handler).await.unwrap();
        assert_eq!(reason, StopReason::IdleTimeout);
        assert_eq!(handler.seen, 0);
    }

    #[tokio::test]
    async fn unrepresentable_timeout_waits_without_deadline() {
        let broker = MemoryBroker::new();
        for body in ["a", "quit"] {
            broker.enqueue("jobs", Message::new(body));
        }
        let mut props = Properties::new();
        props.set("persistent", true);
        props.set("timeout", 1e20);
        let mut consumer = consumer(&broker, props);
        let mut handler = AckAll { seen: 0 };

        let reason = consumer.consume("jobs", &mut handler).await.unwrap();

        assert_eq!(reason, StopReason::Cancelled);
        assert_eq!(handler.seen, 2);
    }

    struct FailFirst;

    #[async_trait]
    impl MessageHandler for FailFirst {
        async fn handle(
            &mut self,
            _delivery: Delivery,
            _session: &mut ConsumerSession<'_>,
        ) -> Result<ConsumeFlow> {
            Err(AmqpError::Handler(anyhow::anyhow!("handler blew up")))
        }
    }

    #[tokio::test]
    async fn failed_session_does_not_leak_into_the_next_one() {
        let broker = MemoryBroker::new();
        broker.enqueue("a", Message::new("a1"));
        broker.enqueue("a", Message::new("a2"));
        broker.enqueue("b", Message::new("b1"));
        let mut props = Properties::new();
        props.set("consumer_tag", "worker-a");
        let mut consumer = consumer(&broker, props);

        assert!(consumer.consume("a", &mut FailFirst).await.is_err());
        assert!(broker.calls().contains(&BrokerCall::Cancel {
            consumer_tag: "worker-a".to_string()
        }));

        consumer.properties_mut().set("consumer_tag", "worker-b");
        let mut handler = Drain::default();
        let reason = consumer.consume("b", &mut handler).await.unwrap();

        assert_eq!(reason, StopReason::Processed);
        assert_eq!(handler.bodies, vec!["b1"]);
        assert_eq!(broker.queue_depth("b"), Some(0));
    }

    #[tokio::test]
    async fn qos_is_applied_once_before_consuming() {
        let broker = MemoryBroker::new();
        broker.enqueue("jobs", Message::new("x"));
        let mut props = Properties::new();
        props.set("qos", true);
        props.set("qos_prefetch_count", 5);
        let mut consumer = consumer(&broker, props);

        consumer.consume("jobs", &mut Drain::default()).await.unwrap();

        let calls = broker.calls();
        let qos: Vec<_> = calls
            .iter()
            .enumerate()
            .filter(|(_, call)| matches!(call, BrokerCall::Qos { .. }))
            .collect();
        let consume_at = calls
            .iter()
            .position(|call| matches!(call, BrokerCall::Consume { .. }))
            .unwrap();

        assert_eq!(qos.len(), 1);
        assert!(qos[0].0 < consume_at);
        assert_eq!(
            qos[0].1,
            &BrokerCall::Qos {
                prefetch_size: 0,
                prefetch_count: 5,
                global: false
            }
        );
    }

    struct RejectOnce;

    #[async_trait]
    impl MessageHandler for RejectOnce {
        async fn handle(
            &mut self,
            delivery: Delivery,
            session: &mut ConsumerSession<'_>,
        ) -> Result<ConsumeFlow> {
            session.reject(&delivery, true).await?;
            Ok(ConsumeFlow::Stop)
        }
    }

    #[tokio::test]
    async fn rejected_with_requeue_goes_back_to_the_queue() {
        let broker = MemoryBroker::new();
        broker.enqueue("jobs", Message::new("retry me"));
        let mut consumer = consumer(&broker, Properties::new());

        let reason = consumer.consume("jobs", &mut RejectOnce).await.unwrap();

        assert_eq!(reason, StopReason::Processed);
        assert_eq!(broker.queue_depth("jobs"), Some(1));
        assert!(broker.calls().contains(&BrokerCall::Reject {
            delivery_tag: 1,
            requeue: true
        }));
    }

    #[tokio::test]
    async fn closed_channel_surfaces_as_transport_error() {
        let broker = MemoryBroker::new();
        broker.declare_queue("jobs");
        let mut props = Properties::new();
        props.set("persistent", true);
        let mut consumer = consumer(&broker, props);

        let killer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            killer.kill_channels();
        });

        let err = consumer
            .consume("jobs", &mut AckAll { seen: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::Transport(_)));
    }

    #[tokio::test]
    async fn missing_exchange_is_a_configuration_error() {
        let broker = MemoryBroker::new();
        let mut props = Properties::new();
        props.set("exchange", "");
        let mut consumer = consumer(&broker, props);

        let err = consumer
            .consume("jobs", &mut AckAll { seen: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::Configuration(_)));
        assert_eq!(broker.connection_count(), 0);
    }
}
