// src/rabbitmq/publisher.rs
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::batch::BatchManager;
use super::connection::ConnectionManager;
use super::errors::{AmqpError, Result};
use super::message::Message;
use super::topology::{ExchangeManager, QueueManager};
use super::transport::{ConfirmEvent, ConfirmWait, DeclaredQueue, ReturnedMessage};
use crate::config::{keys, Properties};

/// Outcome of one publish attempt, decided once after the confirm wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishResult {
    /// Sent, but no confirm was awaited or it did not arrive in time.
    Pending,
    Confirmed,
    /// Nacked by the broker or returned as unroutable.
    Rejected,
}

impl PublishResult {
    pub fn is_ok(&self) -> bool {
        !matches!(self, PublishResult::Rejected)
    }
}

/// What a batch flush sent and how the broker answered for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub sent: usize,
    /// Resolved the same way as for a single publish; `Rejected` if any message was.
    pub result: PublishResult,
}

/// Callbacks for broker confirms. They run inside the wait that received them
/// and must not block on the channel.
pub trait ConfirmListener: Send + Sync {
    fn on_ack(&self, _delivery_tag: u64) {}

    fn on_nack(&self, _delivery_tag: u64) {}

    fn on_return(&self, _returned: &ReturnedMessage) {}
}

pub struct Publisher {
    connection: ConnectionManager,
    properties: Properties,
    listener: Option<Arc<dyn ConfirmListener>>,
    confirms_enabled: bool,
    declared: bool,
}

impl Publisher {
    pub fn new(connection: ConnectionManager, properties: Properties) -> Self {
        Self {
            connection,
            properties,
            listener: None,
            confirms_enabled: false,
            declared: false,
        }
    }

    pub fn with_confirm_listener(mut self, listener: Arc<dyn ConfirmListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn confirms_enabled(&self) -> bool {
        self.confirms_enabled
    }

    fn publish_timeout(&self) -> Duration {
        let secs: f64 = self.properties.get_or(keys::PUBLISH_TIMEOUT, 30.0);
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Channel-scoped state does not survive a reconnect.
    fn forget_stale_channel(&mut self) {
        if !self.connection.is_connected() {
            self.confirms_enabled = false;
            self.declared = false;
        }
    }

    /// Declares the exchange, then the queue and its bindings when one is configured.
    pub async fn setup(&mut self) -> Result<Option<DeclaredQueue>> {
        self.properties.require_str(keys::EXCHANGE)?;
        self.forget_stale_channel();

        let channel = self.connection.channel().await?;
        ExchangeManager::new(&mut *channel)
            .declare(&self.properties)
            .await?;
        let declared = QueueManager::new(channel)
            .declare_and_bind(&self.properties)
            .await?;

        self.declared = true;
        Ok(declared)
    }

    async fn ensure_setup(&mut self) -> Result<String> {
        let exchange = self.properties.require_str(keys::EXCHANGE)?.to_string();
        self.forget_stale_channel();
        if !self.declared {
            self.setup().await?;
        }
        Ok(exchange)
    }

    /// Puts the channel in confirm mode once; later calls are no-ops.
    pub async fn enable_confirms(&mut self) -> Result<()> {
        self.forget_stale_channel();
        if self.confirms_enabled {
            return Ok(());
        }
        self.connection.channel().await?.confirm_select().await?;
        debug!("Publisher confirms enabled");
        self.confirms_enabled = true;
        Ok(())
    }

    /// Sends one message to the configured exchange.
    ///
    /// `mandatory` publishes switch the channel to confirm mode so an
    /// unroutable message comes back as [`PublishResult::Rejected`].
    pub async fn publish(
        &mut self,
        routing_key: &str,
        message: &Message,
        mandatory: bool,
    ) -> Result<PublishResult> {
        let exchange = self.ensure_setup().await?;
        if mandatory || self.properties.get_bool(keys::PUBLISHER_CONFIRMS) {
            self.enable_confirms().await?;
        }

        debug!(exchange = %exchange, routing_key = %routing_key, mandatory, "Publishing message");
        self.connection
            .channel()
            .await?
            .basic_publish(&exchange, routing_key, mandatory, message)
            .await?;

        if !self.confirms_enabled {
            return Ok(PublishResult::Confirmed);
        }
        if !self.properties.get_or(keys::WAIT_FOR_CONFIRMS, true) {
            return Ok(PublishResult::Pending);
        }
        let timeout = self.publish_timeout();
        self.wait_for_confirms(timeout).await
    }

    /// Waits for every outstanding confirm on the channel.
    pub async fn wait_for_confirms(&mut self, timeout: Duration) -> Result<PublishResult> {
        if !self.confirms_enabled {
            return Err(AmqpError::ConfirmsNotEnabled);
        }
        let wait = self
            .connection
            .channel()
            .await?
            .wait_for_confirms(timeout)
            .await?;
        Ok(self.resolve(wait))
    }

    fn resolve(&self, wait: ConfirmWait) -> PublishResult {
        let mut rejected = false;

        for event in &wait.events {
            match event {
                ConfirmEvent::Ack { delivery_tag } => {
                    if let Some(listener) = &self.listener {
                        listener.on_ack(*delivery_tag);
                    }
                }
                ConfirmEvent::Nack { delivery_tag } => {
                    warn!(delivery_tag, "Broker nacked message");
                    rejected = true;
                    if let Some(listener) = &self.listener {
                        listener.on_nack(*delivery_tag);
                    }
                }
                ConfirmEvent::Return(returned) => {
                    warn!(
                        exchange = %returned.exchange,
                        routing_key = %returned.routing_key,
                        reply_code = returned.reply_code,
                        reply_text = %returned.reply_text,
                        "Message returned as unroutable"
                    );
                    rejected = true;
                    if let Some(listener) = &self.listener {
                        listener.on_return(returned);
                    }
                }
            }
        }

        if rejected {
            PublishResult::Rejected
        } else if wait.outstanding > 0 {
            debug!(outstanding = wait.outstanding, "Confirm wait timed out");
            PublishResult::Pending
        } else {
            PublishResult::Confirmed
        }
    }

    /// Flushes the whole batch in one channel call.
    pub async fn batch_publish(&mut self, batch: &mut BatchManager) -> Result<BatchOutcome> {
        let exchange = self.ensure_setup().await?;
        if self.properties.get_bool(keys::PUBLISHER_CONFIRMS) {
            self.enable_confirms().await?;
        }

        let channel = self.connection.channel().await?;
        let sent = batch.flush(channel, &exchange).await?;

        let result = if sent == 0 || !self.confirms_enabled {
            PublishResult::Confirmed
        } else if !self.properties.get_or(keys::WAIT_FOR_CONFIRMS, true) {
            PublishResult::Pending
        } else {
            let timeout = self.publish_timeout();
            self.wait_for_confirms(timeout).await?
        };
        if result == PublishResult::Rejected {
            warn!(exchange = %exchange, size = sent, "Batch had rejected messages");
        }
        Ok(BatchOutcome { sent, result })
    }

    pub async fn shutdown(&mut self) {
        self.connection.disconnect().await;
        self.confirms_enabled = false;
        self.declared = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::rabbitmq::{BrokerCall, MemoryBroker};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ConfirmListener for Recorder {
        fn on_ack(&self, delivery_tag: u64) {
            self.events.lock().unwrap().push(format!("ack:{}", delivery_tag));
        }

        fn on_nack(&self, delivery_tag: u64) {
            self.events.lock().unwrap().push(format!("nack:{}", delivery_tag));
        }

        fn on_return(&self, returned: &ReturnedMessage) {
            self.events
                .lock()
                .unwrap()
                .push(format!("return:{}", returned.routing_key));
        }
    }

    fn publisher(broker: &MemoryBroker, properties: Properties) -> Publisher {
        let config = ConnectionConfig::from_properties(&properties).unwrap();
        let connection = ConnectionManager::new(config, Arc::new(broker.clone()));
        Publisher::new(connection, properties)
    }

    fn confirm_selects(broker: &MemoryBroker) -> usize {
        broker
            .calls()
            .iter()
            .filter(|call| matches!(call, BrokerCall::ConfirmSelect))
            .count()
    }

    #[tokio::test]
    async fn plain_publish_never_enables_confirms() {
        let broker = MemoryBroker::new();
        let mut publisher = publisher(&broker, Properties::new());

        let result = publisher
            .publish("nobody.listens", &Message::new("hi"), false)
            .await
            .unwrap();

        assert_eq!(result, PublishResult::Confirmed);
        assert!(result.is_ok());
        assert_eq!(confirm_selects(&broker), 0);
    }

    #[tokio::test]
    async fn mandatory_unroutable_is_rejected() {
        let broker = MemoryBroker::new();
        let recorder = Arc::new(Recorder::default());
        let mut publisher =
            publisher(&broker, Properties::new()).with_confirm_listener(recorder.clone());

        let result = publisher
            .publish("nobody.listens", &Message::new("hi"), true)
            .await
            .unwrap();

        assert_eq!(result, PublishResult::Rejected);
        assert!(!result.is_ok());
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["return:nobody.listens".to_string(), "ack:1".to_string()]
        );
    }

    #[tokio::test]
    async fn mandatory_routable_is_confirmed_and_confirms_enabled_once() {
        let broker = MemoryBroker::new();
        let mut props = Properties::new();
        props.set("queue", "orders");
        props.set("routing", "orders.#");
        let mut publisher = publisher(&broker, props);

        for _ in 0..2 {
            let result = publisher
                .publish("orders.created", &Message::new("{}"), true)
                .await
                .unwrap();
            assert_eq!(result, PublishResult::Confirmed);
        }

        assert_eq!(confirm_selects(&broker), 1);
        assert_eq!(broker.queue_depth("orders"), Some(2));
    }

    #[tokio::test]
    async fn nack_is_rejected() {
        let broker = MemoryBroker::new();
        let recorder = Arc::new(Recorder::default());
        let mut props = Properties::new();
        props.set("publisher_confirms", true);
        let mut publisher = publisher(&broker, props).with_confirm_listener(recorder.clone());

        broker.nack_next_publish();
        let result = publisher.publish("k", &Message::new("x"), false).await.unwrap();

        assert_eq!(result, PublishResult::Rejected);
        assert_eq!(*recorder.events.lock().unwrap(), vec!["nack:1".to_string()]);
    }

    #[tokio::test]
    async fn unanswered_confirms_stay_pending() {
        let broker = MemoryBroker::new();
        let mut props = Properties::new();
        props.set("publisher_confirms", true);
        props.set("publish_timeout", 0.01);
        let mut publisher = publisher(&broker, props);

        broker.withhold_confirms(true);
        let result = publisher.publish("k", &Message::new("x"), false).await.unwrap();

        assert_eq!(result, PublishResult::Pending);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unrepresentable_publish_timeout_does_not_panic() {
        let broker = MemoryBroker::new();
        let mut props = Properties::new();
        props.set("publisher_confirms", true);
        props.set("publish_timeout", 1e20);
        let mut publisher = publisher(&broker, props);

        let result = publisher.publish("k", &Message::new("x"), false).await.unwrap();
        assert_eq!(result, PublishResult::Confirmed);
    }

    #[tokio::test]
    async fn not_waiting_leaves_result_pending() {
        let broker = MemoryBroker::new();
        let mut props = Properties::new();
        props.set("wait_for_confirms", false);
        let mut publisher = publisher(&broker, props);

        let result = publisher.publish("k", &Message::new("x"), true).await.unwrap();
        assert_eq!(result, PublishResult::Pending);
        assert!(!broker
            .calls()
            .iter()
            .any(|call| matches!(call, BrokerCall::WaitForConfirms)));
    }

    #[tokio::test]
    async fn waiting_without_confirms_is_an_error() {
        let broker = MemoryBroker::new();
        let mut publisher = publisher(&broker, Properties::new());

        let err = publisher
            .wait_for_confirms(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::ConfirmsNotEnabled));
    }

    #[tokio::test]
    async fn missing_exchange_fails_before_connecting() {
        let broker = MemoryBroker::new();
        let mut props = Properties::new();
        props.set("exchange", "");
        let mut publisher = publisher(&broker, props);

        let err = publisher
            .publish("k", &Message::new("x"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::Configuration(_)));
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn batch_is_flushed_once_and_cleared() {
        let broker = MemoryBroker::new();
        let mut props = Properties::new();
        props.set("queue", "audit");
        props.set("routing", "#");
        let mut publisher = publisher(&broker, props);

        let mut batch = BatchManager::new();
        for i in 0..3 {
            batch.add(format!("audit.{}", i), Message::new(format!("entry {}", i)));
        }

        let outcome = publisher.batch_publish(&mut batch).await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome {
                sent: 3,
                result: PublishResult::Confirmed
            }
        );
        assert!(batch.is_empty());
        assert_eq!(broker.queue_depth("audit"), Some(3));

        let flushes: Vec<_> = broker
            .calls()
            .into_iter()
            .filter(|call| matches!(call, BrokerCall::PublishBatch { .. }))
            .collect();
        assert_eq!(
            flushes,
            vec![BrokerCall::PublishBatch {
                exchange: "amq.topic".to_string(),
                size: 3
            }]
        );
    }

    #[tokio::test]
    async fn failed_flush_keeps_the_batch() {
        let broker = MemoryBroker::new();
        let mut publisher = publisher(&broker, Properties::new());

        let mut batch = BatchManager::new();
        batch.add("a", Message::new("1"));
        batch.add("b", Message::new("2"));

        broker.fail_next_batch();
        assert!(publisher.batch_publish(&mut batch).await.is_err());
        assert_eq!(batch.len(), 2);

        publisher.shutdown().await;
        assert_eq!(publisher.batch_publish(&mut batch).await.unwrap().sent, 2);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn nacked_batch_is_reported_as_rejected() {
        let broker = MemoryBroker::new();
        let recorder = Arc::new(Recorder::default());
        let mut props = Properties::new();
        props.set("publisher_confirms", true);
        props.set("queue", "audit");
        props.set("routing", "#");
        let mut publisher = publisher(&broker, props).with_confirm_listener(recorder.clone());

        let mut batch = BatchManager::new();
        batch.add("audit.0", Message::new("first"));
        batch.add("audit.1", Message::new("second"));

        broker.nack_next_publish();
        let outcome = publisher.batch_publish(&mut batch).await.unwrap();

        assert_eq!(outcome.sent, 2);
        assert_eq!(outcome.result, PublishResult::Rejected);
        assert!(!outcome.result.is_ok());
        assert!(batch.is_empty());
        assert_eq!(broker.queue_depth("audit"), Some(1));
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["nack:1".to_string(), "ack:2".to_string()]
        );
    }
}
