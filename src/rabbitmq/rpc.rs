// src/rabbitmq/rpc.rs
//! Request/reply over plain queues.
//!
//! A requester publishes an [`RpcRequest`] carrying its own `correlation_id`
//! and `reply_to`. An [`RpcServer`] drains the request queue, dispatches each
//! request to a registered [`ProcedureHandler`] and publishes an [`RpcReply`]
//! to the nameless exchange, routed by `reply_to`. Whether the reply queue
//! exists is not checked; the broker drops replies with nowhere to go.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::consumer::{ConsumeFlow, Consumer, ConsumerSession, MessageHandler, StopReason};
use super::errors::{AmqpError, Result};
use super::message::{Delivery, Message};
use crate::config::keys;

/// Exchange replies are published to; `reply_to` is the routing key.
pub const REPLY_EXCHANGE: &str = "";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub procedure: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("request body is not valid JSON: {0}")]
    Malformed(String),

    #[error("request must be a JSON object")]
    NotAnObject,

    #[error("'procedure' is required and must be a string")]
    Procedure,

    #[error("'params' is required and must be an array")]
    Params,
}

impl RpcRequest {
    pub fn new(procedure: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            procedure: procedure.into(),
            params,
        }
    }

    /// Decodes and validates a request envelope.
    pub fn parse(body: &[u8]) -> std::result::Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        let envelope = value.as_object().ok_or(ValidationError::NotAnObject)?;

        let procedure = envelope
            .get("procedure")
            .and_then(Value::as_str)
            .ok_or(ValidationError::Procedure)?;
        let params = envelope
            .get("params")
            .and_then(Value::as_array)
            .ok_or(ValidationError::Params)?;

        Ok(Self::new(procedure, params.clone()))
    }

    /// A JSON message ready to publish, carrying the caller's correlation pair.
    pub fn into_message(
        self,
        correlation_id: impl Into<String>,
        reply_to: impl Into<String>,
    ) -> Result<Message> {
        Ok(Message::json(&self)?
            .with_correlation_id(correlation_id)
            .with_reply_to(reply_to))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub result: Value,
    pub error: Option<String>,
}

impl RpcReply {
    pub fn success(result: Value) -> Self {
        Self {
            result,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            result: Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[async_trait]
pub trait ProcedureHandler: Send + Sync {
    async fn handle(&self, params: Vec<Value>) -> anyhow::Result<Value>;
}

#[derive(Default, Clone)]
pub struct ProcedureRegistry {
    handlers: HashMap<String, Arc<dyn ProcedureHandler>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, procedure: impl Into<String>, handler: H) -> &mut Self
    where
        H: ProcedureHandler + 'static,
    {
        self.handlers.insert(procedure.into(), Arc::new(handler));
        self
    }

    pub fn contains(&self, procedure: &str) -> bool {
        self.handlers.contains_key(procedure)
    }

    /// Runs the request in `body`. Never fails: every problem becomes an error reply.
    pub async fn dispatch(&self, body: &[u8]) -> RpcReply {
        let request = match RpcRequest::parse(body) {
            Ok(request) => request,
            Err(err) => {
                warn!("Invalid RPC request: {}", err);
                return RpcReply::failure(err.to_string());
            }
        };

        let Some(handler) = self.handlers.get(&request.procedure) else {
            warn!(procedure = %request.procedure, "Unknown RPC procedure");
            return RpcReply::failure(format!("unknown procedure '{}'", request.procedure));
        };

        debug!(procedure = %request.procedure, params = request.params.len(), "Dispatching RPC request");
        match handler.handle(request.params).await {
            Ok(result) => RpcReply::success(result),
            Err(err) => {
                error!(procedure = %request.procedure, "RPC procedure failed: {:#}", err);
                RpcReply::failure(err.to_string())
            }
        }
    }
}

struct Responder<'r> {
    registry: &'r ProcedureRegistry,
    drain: bool,
}

#[async_trait]
impl<'r> MessageHandler for Responder<'r> {
    async fn handle(
        &mut self,
        delivery: Delivery,
        session: &mut ConsumerSession<'_>,
    ) -> Result<ConsumeFlow> {
        let reply = self.registry.dispatch(delivery.body()).await;

        let reply_to = delivery
            .message
            .reply_to()
            .filter(|reply_to| !reply_to.is_empty())
            .ok_or_else(|| AmqpError::CannotCorrelate("request has no reply_to".to_string()))?;
        let correlation_id = delivery
            .message
            .correlation_id()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AmqpError::CannotCorrelate("request has no correlation_id".to_string())
            })?;

        let message = Message::json(&reply)?.with_correlation_id(correlation_id);
        session.publish(REPLY_EXCHANGE, reply_to, &message).await?;
        debug!(reply_to = %reply_to, correlation_id = %correlation_id, error = reply.is_error(), "RPC reply sent");

        if self.drain {
            Ok(session.stop_when_processed())
        } else {
            Ok(ConsumeFlow::Continue)
        }
    }
}

/// Serves procedures from a request queue. Deliveries are auto-acked.
///
/// With `persistent` off the server drains what was queued at start and returns;
/// with it on it runs until idle for `timeout` seconds (forever when 0).
pub struct RpcServer {
    consumer: Consumer,
    registry: ProcedureRegistry,
}

impl RpcServer {
    pub fn new(mut consumer: Consumer, registry: ProcedureRegistry) -> Self {
        consumer.properties_mut().set(keys::CONSUMER_NO_ACK, true);
        Self { consumer, registry }
    }

    pub fn registry(&self) -> &ProcedureRegistry {
        &self.registry
    }

    pub async fn serve(&mut self, queue: &str) -> Result<StopReason> {
        let mut responder = Responder {
            registry: &self.registry,
            drain: !self.consumer.properties().get_bool(keys::PERSISTENT),
        };
        self.consumer.consume(queue, &mut responder).await
    }

    pub async fn shutdown(&mut self) {
        self.consumer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, Properties};
    use crate::rabbitmq::{BrokerCall, ConnectionManager, MemoryBroker};
    use anyhow::anyhow;
    use serde_json::json;

    struct Add;

    #[async_trait]
    impl ProcedureHandler for Add {
        async fn handle(&self, params: Vec<Value>) -> anyhow::Result<Value> {
            let sum: i64 = params.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        }
    }

    struct Broken;

    #[async_trait]
    impl ProcedureHandler for Broken {
        async fn handle(&self, _params: Vec<Value>) -> anyhow::Result<Value> {
            Err(anyhow!("database unavailable"))
        }
    }

    fn registry() -> ProcedureRegistry {
        let mut registry = ProcedureRegistry::new();
        registry.register("add", Add).register("broken", Broken);
        registry
    }

    fn server(broker: &MemoryBroker, properties: Properties) -> RpcServer {
        let config = ConnectionConfig::from_properties(&properties).unwrap();
        let consumer = Consumer::new(
            ConnectionManager::new(config, Arc::new(broker.clone())),
            properties,
        );
        RpcServer::new(consumer, registry())
    }

    fn reply_body(message: &Message) -> Value {
        serde_json::from_slice(message.body()).unwrap()
    }

    #[test]
    fn parse_validates_envelope() {
        assert_eq!(
            RpcRequest::parse(br#"{"procedure": "add", "params": [1, 2]}"#),
            Ok(RpcRequest::new("add", vec![json!(1), json!(2)]))
        );
        assert_eq!(
            RpcRequest::parse(br#"{"params": []}"#),
            Err(ValidationError::Procedure)
        );
        assert_eq!(
            RpcRequest::parse(br#"{"procedure": 7, "params": []}"#),
            Err(ValidationError::Procedure)
        );
        assert_eq!(
            RpcRequest::parse(br#"{"procedure": "add", "params": {"a": 1}}"#),
            Err(ValidationError::Params)
        );
        assert_eq!(RpcRequest::parse(b"[1]"), Err(ValidationError::NotAnObject));
        assert!(matches!(
            RpcRequest::parse(b"not json"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_turns_every_failure_into_an_error_reply() {
        let registry = registry();

        let ok = registry
            .dispatch(br#"{"procedure": "add", "params": [1, 2]}"#)
            .await;
        assert_eq!(ok, RpcReply::success(json!(3)));

        let failing: [&[u8]; 4] = [
            br#"{"params": [1]}"#,
            br#"{"procedure": "add", "params": "1,2"}"#,
            br#"{"procedure": "missing", "params": []}"#,
            br#"{"procedure": "broken", "params": []}"#,
        ];
        for body in failing {
            let reply = registry.dispatch(body).await;
            assert_eq!(reply.result, Value::Null);
            assert!(reply.is_error());
        }

        let broken = registry
            .dispatch(br#"{"procedure": "broken", "params": []}"#)
            .await;
        assert_eq!(broken.error.as_deref(), Some("database unavailable"));
    }

    #[test]
    fn failure_reply_serializes_null_result() {
        let reply = RpcReply::failure("boom");
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"result": null, "error": "boom"})
        );
    }

    #[test]
    fn request_message_carries_correlation_pair() {
        let message = RpcRequest::new("add", vec![json!(1)])
            .into_message("corr-1", "replies")
            .unwrap();
        assert_eq!(message.correlation_id(), Some("corr-1"));
        assert_eq!(message.reply_to(), Some("replies"));
        assert_eq!(
            message.properties().content_type.as_deref(),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn server_replies_to_each_request_and_survives_bad_ones() {
        let broker = MemoryBroker::new();
        broker.declare_queue("replies");
        broker.enqueue(
            "rpc",
            Message::new("garbage")
                .with_correlation_id("c-1")
                .with_reply_to("replies"),
        );
        broker.enqueue(
            "rpc",
            RpcRequest::new("add", vec![json!(2), json!(5)])
                .into_message("c-2", "replies")
                .unwrap(),
        );

        let mut server = server(&broker, Properties::new());
        let reason = server.serve("rpc").await.unwrap();
        assert_eq!(reason, StopReason::Processed);

        let replies = broker.queue_messages("replies");
        assert_eq!(replies.len(), 2);

        assert_eq!(replies[0].correlation_id(), Some("c-1"));
        assert_eq!(reply_body(&replies[0])["result"], Value::Null);
        assert!(reply_body(&replies[0])["error"].is_string());

        assert_eq!(replies[1].correlation_id(), Some("c-2"));
        assert_eq!(reply_body(&replies[1]), json!({"result": 7, "error": null}));

        assert!(broker.calls().iter().any(|call| matches!(
            call,
            BrokerCall::Consume { queue, no_ack: true, .. } if queue == "rpc"
        )));
        assert!(broker.calls().contains(&BrokerCall::Publish {
            exchange: "".to_string(),
            routing_key: "replies".to_string(),
            mandatory: false
        }));
    }

    #[tokio::test]
    async fn request_without_reply_to_cannot_be_correlated() {
        let broker = MemoryBroker::new();
        broker.enqueue(
            "rpc",
            Message::json(&json!({"procedure": "add", "params": []}))
                .unwrap()
                .with_correlation_id("c-1"),
        );

        let mut server = server(&broker, Properties::new());
        let err = server.serve("rpc").await.unwrap_err();
        assert!(matches!(err, AmqpError::CannotCorrelate(_)));
    }

    #[tokio::test]
    async fn persistent_server_stops_when_idle() {
        let broker = MemoryBroker::new();
        broker.declare_queue("replies");
        broker.enqueue(
            "rpc",
            RpcRequest::new("add", vec![json!(1)])
                .into_message("c-1", "replies")
                .unwrap(),
        );
        let mut props = Properties::new();
        props.set("persistent", true);
        props.set("timeout", 0.05);

        let mut server = server(&broker, props);
        assert_eq!(server.serve("rpc").await.unwrap(), StopReason::IdleTimeout);
        assert_eq!(broker.queue_depth("replies"), Some(1));
    }
}
