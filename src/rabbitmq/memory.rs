// src/rabbitmq/memory.rs
//! Brokerless transport.
//!
//! `MemoryBroker` keeps exchanges, queues and bindings in-process and hands
//! out connections like a real broker would. Routing follows AMQP 0-9-1 for
//! the default, direct, fanout and topic exchanges; headers exchanges route to
//! every bound queue. The most recent channel-level calls are journaled so
//! callers can assert on the exact interaction with the broker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::batch::BatchItem;
use super::errors::{AmqpError, Result};
use super::message::{Delivery, Message};
use super::topology::{ExchangeKind, ExchangeSpec, QueueSpec};
use super::transport::{
    AmqpChannel, AmqpConnection, ConfirmBacklog, ConfirmEvent, ConfirmWait, ConsumeOptions,
    Connector, DeclaredQueue, ReturnedMessage,
};
use crate::config::ConnectionConfig;

const NO_ROUTE: u16 = 312;

/// Journal entries kept by [`MemoryBroker::calls`]; older ones are dropped.
pub const CALL_JOURNAL_LIMIT: usize = 1024;

/// One channel-level interaction, as seen by the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCall {
    ExchangeDeclare { exchange: String },
    ExchangeDelete { exchange: String },
    ExchangeUnbind { destination: String, source: String, routing_key: String },
    QueueDeclare { queue: String },
    QueueBind { queue: String, exchange: String, routing_key: String },
    QueueUnbind { queue: String, exchange: String, routing_key: String },
    QueuePurge { queue: String },
    QueueDelete { queue: String },
    ConfirmSelect,
    Publish { exchange: String, routing_key: String, mandatory: bool },
    PublishBatch { exchange: String, size: usize },
    WaitForConfirms,
    Qos { prefetch_size: u32, prefetch_count: u16, global: bool },
    Consume { queue: String, consumer_tag: String, no_ack: bool },
    Cancel { consumer_tag: String },
    Ack { delivery_tag: u64 },
    Reject { delivery_tag: u64, requeue: bool },
    ChannelClose,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    message: Message,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    messages: VecDeque<StoredMessage>,
    consumers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    calls: VecDeque<BrokerCall>,
    connections: usize,
    generation: u64,
    refuse_connections: bool,
    nack_next_publish: bool,
    fail_next_batch: bool,
    withhold_confirms: bool,
    fail_closes: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broker. Clones share the same state.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker with the default exchange and the standard `amq.*` exchanges.
    pub fn new() -> Self {
        let broker = MemoryBroker {
            shared: Arc::new(Shared::default()),
        };
        {
            let mut state = broker.shared.lock();
            for (name, kind) in [
                ("", ExchangeKind::Direct),
                ("amq.direct", ExchangeKind::Direct),
                ("amq.fanout", ExchangeKind::Fanout),
                ("amq.topic", ExchangeKind::Topic),
                ("amq.headers", ExchangeKind::Headers),
            ] {
                state
                    .exchanges
                    .insert(name.to_string(), ExchangeSpec::new(name, kind));
            }
        }
        broker
    }

    /// The most recent calls, oldest first. Only the last [`CALL_JOURNAL_LIMIT`] are kept.
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.shared.lock().calls.iter().cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.shared.lock().calls.clear();
    }

    /// Number of connections opened so far.
    pub fn connection_count(&self) -> usize {
        self.shared.lock().connections
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.shared.lock().exchanges.contains_key(exchange)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }

    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.messages.len())
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<Map<String, Value>> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.spec.arguments.clone())
    }

    /// Ready (undelivered) messages on `queue`, head first.
    pub fn queue_messages(&self, queue: &str) -> Vec<Message> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    /// `(exchange, routing_key)` pairs bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.shared
            .lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.routing_key.clone()))
            .collect()
    }

    /// Declares a durable queue with no arguments, bypassing any channel.
    pub fn declare_queue(&self, queue: &str) {
        let mut state = self.shared.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState {
                spec: QueueSpec::new(queue),
                messages: VecDeque::new(),
                consumers: 0,
            });
    }

    /// Appends a message straight onto `queue`, declaring it if needed.
    pub fn enqueue(&self, queue: &str, message: Message) {
        self.declare_queue(queue);
        {
            let mut state = self.shared.lock();
            if let Some(q) = state.queues.get_mut(queue) {
                q.messages.push_back(StoredMessage {
                    exchange: String::new(),
                    routing_key: queue.to_string(),
                    redelivered: false,
                    message,
                });
            }
        }
        self.shared.notify.notify_waiters();
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.lock().refuse_connections = refuse;
    }

    /// The next confirmed publish is nacked instead of routed.
    pub fn nack_next_publish(&self) {
        self.shared.lock().nack_next_publish = true;
    }

    /// The next batch flush fails before anything is routed.
    pub fn fail_next_batch(&self) {
        self.shared.lock().fail_next_batch = true;
    }

    /// Publishes are routed but their confirms never arrive.
    pub fn withhold_confirms(&self, withhold: bool) {
        self.shared.lock().withhold_confirms = withhold;
    }

    /// Channel and connection closes report an error after releasing their resources.
    pub fn fail_closes(&self, fail: bool) {
        self.shared.lock().fail_closes = fail;
    }

    /// Forcibly closes every open channel, as a broker-side connection drop would.
    pub fn kill_channels(&self) {
        self.shared.lock().generation += 1;
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn AmqpConnection>> {
        let generation = {
            let mut state = self.shared.lock();
            if state.refuse_connections {
                return Err(AmqpError::Connection(format!(
                    "connection refused by {}:{}",
                    config.host, config.port
                )));
            }
            state.connections += 1;
            state.generation
        };

        debug!(host = %config.host, vhost = %config.vhost, "Opened in-memory connection");
        Ok(Box::new(MemoryConnection {
            shared: self.shared.clone(),
            generation,
            open: true,
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    generation: u64,
    open: bool,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    async fn create_channel(&mut self) -> Result<Box<dyn AmqpChannel>> {
        if !self.is_open() {
            return Err(AmqpError::Connection("connection is closed".to_string()));
        }
        Ok(Box::new(MemoryChannel {
            shared: self.shared.clone(),
            generation: self.generation,
            open: true,
            confirms: false,
            pending: ConfirmBacklog::default(),
            withheld: 0,
            publish_seq: 0,
            consumers: Vec::new(),
            next_consumer: 0,
            next_delivery_tag: 1,
            unacked: HashMap::new(),
        }))
    }

    fn is_open(&self) -> bool {
        self.open && self.shared.lock().generation == self.generation
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        if self.shared.lock().fail_closes {
            return Err(AmqpError::Connection("connection reset during close".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ConsumerEntry {
    tag: String,
    queue: String,
    no_ack: bool,
}

struct MemoryChannel {
    shared: Arc<Shared>,
    generation: u64,
    open: bool,
    confirms: bool,
    pending: ConfirmBacklog,
    withheld: usize,
    publish_seq: u64,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
    next_delivery_tag: u64,
    unacked: HashMap<u64, (String, StoredMessage)>,
}

fn not_found(what: &str, name: &str) -> AmqpError {
    AmqpError::Protocol(format!("NOT_FOUND - no {} '{}' in vhost '/'", what, name))
}

fn precondition_failed(detail: String) -> AmqpError {
    AmqpError::Protocol(format!("PRECONDITION_FAILED - {}", detail))
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], words: &[&str]) -> bool {
        match pattern.split_first() {
            None => words.is_empty(),
            Some((&"#", rest)) => (0..=words.len()).any(|skip| matches(rest, &words[skip..])),
            Some((&"*", rest)) => !words.is_empty() && matches(rest, &words[1..]),
            Some((word, rest)) => words.first() == Some(word) && matches(rest, &words[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &words)
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        let spec = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| not_found("exchange", exchange))?;

        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let hit = match &spec.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Custom(_) => false,
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn store(&mut self, queues: &[String], exchange: &str, routing_key: &str, message: &Message) {
        for queue in queues {
            if let Some(q) = self.queues.get_mut(queue) {
                q.messages.push_back(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                    message: message.clone(),
                });
            }
        }
    }
}

impl MemoryChannel {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.shared.lock()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AmqpError::Transport("channel is closed".to_string()))
        }
    }

    /// Channel-level errors close the channel, as they do on a real broker.
    fn fail(&mut self, err: AmqpError) -> AmqpError {
        self.open = false;
        err
    }

    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|err| self.fail(err))
    }

    fn record(&self, call: BrokerCall) {
        let mut state = self.lock();
        if state.calls.len() == CALL_JOURNAL_LIMIT {
            state.calls.pop_front();
        }
        state.calls.push_back(call);
    }

    fn route_one(
        &mut self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: &Message,
    ) -> Result<()> {
        let (events, withheld) = {
            let mut state = self.shared.lock();
            let targets = state.route(exchange, routing_key)?;
            let mut events = Vec::new();

            if self.confirms {
                self.publish_seq += 1;
                let delivery_tag = self.publish_seq;
                if state.nack_next_publish {
                    state.nack_next_publish = false;
                    events.push(ConfirmEvent::Nack { delivery_tag });
                } else {
                    if mandatory && targets.is_empty() {
                        events.push(ConfirmEvent::Return(ReturnedMessage {
                            reply_code: NO_ROUTE,
                            reply_text: "NO_ROUTE".to_string(),
                            exchange: exchange.to_string(),
                            routing_key: routing_key.to_string(),
                            message: message.clone(),
                        }));
                    }
                    state.store(&targets, exchange, routing_key, message);
                    events.push(ConfirmEvent::Ack { delivery_tag });
                }
            } else {
                state.store(&targets, exchange, routing_key, message);
            }
            (events, state.withhold_confirms)
        };

        if withheld && self.confirms {
            self.withheld += 1;
        } else {
            for event in events {
                self.pending.push(event);
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn next_ready(&mut self) -> Result<Option<Delivery>> {
        self.ensure_open()?;
        if self.consumers.is_empty() {
            return Ok(None);
        }

        let mut state = self.shared.lock();
        let total = self.consumers.len();
        for offset in 0..total {
            let index = (self.next_consumer + offset) % total;
            let consumer = self.consumers[index].clone();
            let stored = match state.queues.get_mut(&consumer.queue) {
                Some(queue) => queue.messages.pop_front(),
                None => None,
            };
            let Some(stored) = stored else { continue };

            self.next_consumer = (index + 1) % total;
            let delivery_tag = self.next_delivery_tag;
            self.next_delivery_tag += 1;
            if !consumer.no_ack {
                self.unacked
                    .insert(delivery_tag, (consumer.queue.clone(), stored.clone()));
            }
            return Ok(Some(Delivery {
                delivery_tag,
                exchange: stored.exchange,
                routing_key: stored.routing_key,
                redelivered: stored.redelivered,
                message: stored.message,
            }));
        }
        Ok(None)
    }

    fn requeue(state: &mut BrokerState, queue: &str, mut stored: StoredMessage) {
        if let Some(q) = state.queues.get_mut(queue) {
            stored.redelivered = true;
            q.messages.push_front(stored);
        }
    }

    fn release(&mut self) {
        let unacked: Vec<_> = self.unacked.drain().collect();
        let consumers: Vec<_> = self.consumers.drain(..).collect();
        let mut state = self.shared.lock();
        let mut unacked = unacked;
        unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, (queue, stored)) in unacked {
            Self::requeue(&mut state, &queue, stored);
        }
        for consumer in consumers {
            if let Some(q) = state.queues.get_mut(&consumer.queue) {
                q.consumers = q.consumers.saturating_sub(1);
            }
        }
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn exchange_declare(&mut self, exchange: &ExchangeSpec) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::ExchangeDeclare {
            exchange: exchange.name.clone(),
        });
        let result = {
            let mut state = self.lock();
            let existing = state.exchanges.get(&exchange.name).cloned();
            match existing {
                Some(_) if exchange.passive => Ok(()),
                None if exchange.passive => Err(not_found("exchange", &exchange.name)),
                Some(existing)
                    if existing.kind != exchange.kind
                        || existing.durable != exchange.durable
                        || existing.auto_delete != exchange.auto_delete
                        || existing.internal != exchange.internal
                        || existing.arguments != exchange.arguments =>
                {
                    Err(precondition_failed(format!(
                        "inequivalent arg for exchange '{}' in vhost '/'",
                        exchange.name
                    )))
                }
                Some(_) => Ok(()),
                None => {
                    state
                        .exchanges
                        .insert(exchange.name.clone(), exchange.clone());
                    Ok(())
                }
            }
        };
        self.check(result)
    }

    async fn queue_declare(&mut self, queue: &QueueSpec) -> Result<DeclaredQueue> {
        self.ensure_open()?;
        let name = if queue.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            queue.name.clone()
        };
        self.record(BrokerCall::QueueDeclare {
            queue: name.clone(),
        });

        let result = {
            let mut state = self.lock();
            let existing = state
                .queues
                .get(&name)
                .map(|q| (q.spec.clone(), q.messages.len(), q.consumers));
            match existing {
                None if queue.passive => Err(not_found("queue", &name)),
                Some((spec, _, _))
                    if !queue.passive
                        && (spec.durable != queue.durable
                            || spec.exclusive != queue.exclusive
                            || spec.auto_delete != queue.auto_delete
                            || spec.arguments != queue.arguments) =>
                {
                    Err(precondition_failed(format!(
                        "inequivalent arg for queue '{}' in vhost '/'",
                        name
                    )))
                }
                Some((_, messages, consumers)) => Ok(DeclaredQueue {
                    name: name.clone(),
                    message_count: messages as u32,
                    consumer_count: consumers as u32,
                }),
                None => {
                    let mut spec = queue.clone();
                    spec.name = name.clone();
                    state.queues.insert(
                        name.clone(),
                        QueueState {
                            spec,
                            messages: VecDeque::new(),
                            consumers: 0,
                        },
                    );
                    Ok(DeclaredQueue {
                        name: name.clone(),
                        message_count: 0,
                        consumer_count: 0,
                    })
                }
            }
        };
        self.check(result)
    }

    async fn queue_bind(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::QueueBind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        let result = {
            let mut state = self.lock();
            if !state.queues.contains_key(queue) {
                Err(not_found("queue", queue))
            } else if !state.exchanges.contains_key(exchange) {
                Err(not_found("exchange", exchange))
            } else {
                let binding = Binding {
                    queue: queue.to_string(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                };
                if !state.bindings.contains(&binding) {
                    state.bindings.push(binding);
                }
                Ok(())
            }
        };
        self.check(result)
    }

    async fn queue_unbind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::QueueUnbind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        let result = {
            let mut state = self.lock();
            if !state.queues.contains_key(queue) {
                Err(not_found("queue", queue))
            } else if !state.exchanges.contains_key(exchange) {
                Err(not_found("exchange", exchange))
            } else {
                state.bindings.retain(|b| {
                    !(b.queue == queue && b.exchange == exchange && b.routing_key == routing_key)
                });
                Ok(())
            }
        };
        self.check(result)
    }

    async fn queue_purge(&mut self, queue: &str) -> Result<u32> {
        self.ensure_open()?;
        self.record(BrokerCall::QueuePurge {
            queue: queue.to_string(),
        });
        let result = {
            let mut state = self.lock();
            match state.queues.get_mut(queue) {
                Some(q) => {
                    let purged = q.messages.len() as u32;
                    q.messages.clear();
                    Ok(purged)
                }
                None => Err(not_found("queue", queue)),
            }
        };
        self.check(result)
    }

    async fn queue_delete(&mut self, queue: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        self.ensure_open()?;
        self.record(BrokerCall::QueueDelete {
            queue: queue.to_string(),
        });
        let result = {
            let mut state = self.lock();
            let existing = state
                .queues
                .get(queue)
                .map(|q| (q.consumers, q.messages.len()));
            match existing {
                None => Ok(0),
                Some((consumers, _)) if if_unused && consumers > 0 => Err(precondition_failed(
                    format!("queue '{}' in vhost '/' in use", queue),
                )),
                Some((_, messages)) if if_empty && messages > 0 => Err(precondition_failed(
                    format!("queue '{}' in vhost '/' not empty", queue),
                )),
                Some((_, messages)) => {
                    state.queues.remove(queue);
                    state.bindings.retain(|b| b.queue != queue);
                    Ok(messages as u32)
                }
            }
        };
        self.check(result)
    }

    async fn exchange_delete(&mut self, exchange: &str, if_unused: bool) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::ExchangeDelete {
            exchange: exchange.to_string(),
        });
        let result = {
            let mut state = self.lock();
            let in_use = state.bindings.iter().any(|b| b.exchange == exchange);
            if if_unused && in_use {
                Err(precondition_failed(format!(
                    "exchange '{}' in vhost '/' in use",
                    exchange
                )))
            } else {
                state.exchanges.remove(exchange);
                state.bindings.retain(|b| b.exchange != exchange);
                Ok(())
            }
        };
        self.check(result)
    }

    async fn exchange_unbind(
        &mut self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::ExchangeUnbind {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
        });
        let result = {
            let state = self.lock();
            if !state.exchanges.contains_key(destination) {
                Err(not_found("exchange", destination))
            } else if !state.exchanges.contains_key(source) {
                Err(not_found("exchange", source))
            } else {
                Ok(())
            }
        };
        self.check(result)
    }

    async fn confirm_select(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::ConfirmSelect);
        self.confirms = true;
        Ok(())
    }

    async fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: &Message,
    ) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory,
        });
        let result = self.route_one(exchange, routing_key, mandatory, message);
        self.check(result)
    }

    async fn publish_batch(&mut self, exchange: &str, items: &[BatchItem]) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::PublishBatch {
            exchange: exchange.to_string(),
            size: items.len(),
        });
        {
            let mut state = self.lock();
            if state.fail_next_batch {
                state.fail_next_batch = false;
                return Err(AmqpError::Transport("batch flush interrupted".to_string()));
            }
        }
        for item in items {
            let result = self.route_one(exchange, &item.routing_key, false, &item.message);
            self.check(result)?;
        }
        Ok(())
    }

    async fn wait_for_confirms(&mut self, timeout: Duration) -> Result<ConfirmWait> {
        self.ensure_open()?;
        self.record(BrokerCall::WaitForConfirms);
        if self.withheld > 0 {
            tokio::time::sleep(timeout).await;
        }
        Ok(ConfirmWait {
            events: self.pending.take(),
            outstanding: std::mem::take(&mut self.withheld),
        })
    }

    async fn basic_qos(
        &mut self,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::Qos {
            prefetch_size,
            prefetch_count,
            global,
        });
        Ok(())
    }

    async fn basic_consume(&mut self, queue: &str, options: &ConsumeOptions) -> Result<String> {
        self.ensure_open()?;
        let tag = if options.consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4().simple())
        } else {
            options.consumer_tag.clone()
        };
        self.record(BrokerCall::Consume {
            queue: queue.to_string(),
            consumer_tag: tag.clone(),
            no_ack: options.no_ack,
        });

        let result = {
            let mut state = self.lock();
            match state.queues.get_mut(queue) {
                Some(q) => {
                    q.consumers += 1;
                    Ok(())
                }
                None => Err(not_found("queue", queue)),
            }
        };
        self.check(result)?;

        self.consumers.push(ConsumerEntry {
            tag: tag.clone(),
            queue: queue.to_string(),
            no_ack: options.no_ack,
        });
        Ok(tag)
    }

    async fn basic_cancel(&mut self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::Cancel {
            consumer_tag: consumer_tag.to_string(),
        });
        if let Some(index) = self.consumers.iter().position(|c| c.tag == consumer_tag) {
            let consumer = self.consumers.remove(index);
            self.next_consumer = 0;
            if let Some(q) = self.lock().queues.get_mut(&consumer.queue) {
                q.consumers = q.consumers.saturating_sub(1);
            }
        }
        Ok(())
    }

    fn has_consumers(&self) -> bool {
        !self.consumers.is_empty()
    }

    async fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Delivery>> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let shared = self.shared.clone();
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.next_ready()? {
                return Ok(Some(delivery));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn basic_ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::Ack { delivery_tag });
        if self.unacked.remove(&delivery_tag).is_none() {
            return Err(self.fail(precondition_failed(format!(
                "unknown delivery tag {}",
                delivery_tag
            ))));
        }
        Ok(())
    }

    async fn basic_reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::Reject {
            delivery_tag,
            requeue,
        });
        let Some((queue, stored)) = self.unacked.remove(&delivery_tag) else {
            return Err(self.fail(precondition_failed(format!(
                "unknown delivery tag {}",
                delivery_tag
            ))));
        };
        if requeue {
            Self::requeue(&mut self.lock(), &queue, stored);
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open && self.shared.lock().generation == self.generation
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.record(BrokerCall::ChannelClose);
        self.release();
        self.open = false;
        self.shared.notify.notify_waiters();
        if self.lock().fail_closes {
            return Err(AmqpError::Transport("channel close interrupted".to_string()));
        }
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if self.open {
            self.release();
        }
    }
}
