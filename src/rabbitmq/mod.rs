// src/rabbitmq/mod.rs
// RabbitMQ session layer: connection lifecycle, topology, publishing, consuming and RPC

pub mod errors;
pub mod transport;
pub mod connection;
pub mod topology;
pub mod message;
pub mod batch;
pub mod publisher;
pub mod consumer;
pub mod rpc;

// Transports
pub mod lapin_transport;
pub mod memory;

// Re-export specific items to simplify imports elsewhere
pub use batch::{BatchItem, BatchManager};
pub use connection::ConnectionManager;
pub use consumer::{ConsumeFlow, Consumer, ConsumerSession, MessageHandler, StopReason};
pub use errors::{AmqpError, Result};
pub use lapin_transport::LapinConnector;
pub use memory::{BrokerCall, MemoryBroker};
pub use message::{Delivery, Message, MessageProperties};
pub use publisher::{BatchOutcome, ConfirmListener, PublishResult, Publisher};
pub use rpc::{ProcedureHandler, ProcedureRegistry, RpcReply, RpcRequest, RpcServer, ValidationError};
pub use topology::{ExchangeKind, ExchangeManager, ExchangeSpec, QueueManager, QueueSpec};
pub use transport::{
    AmqpChannel, AmqpConnection, ConfirmBacklog, ConfirmEvent, ConfirmWait, ConsumeOptions,
    Connector, DeclaredQueue, ReturnedMessage, CONFIRM_BACKLOG_LIMIT,
};
