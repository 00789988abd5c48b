//! Publish, consume and RPC sessions over RabbitMQ.
//!
//! [`Amqp`] is the entry point for one-shot calls driven by a [`Properties`]
//! map. The session types in [`rabbitmq`] can be used directly when a
//! connection should outlive a single call.

pub mod amqp;
pub mod config;
pub mod rabbitmq;

pub use amqp::Amqp;
pub use config::{ConnectionConfig, Properties, TlsOptions};
pub use rabbitmq::{
    AmqpError, BatchOutcome, ConsumeFlow, ConsumerSession, Delivery, MemoryBroker, Message,
    MessageHandler, PublishResult, Result, StopReason,
};
