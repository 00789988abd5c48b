//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use rabbitmq_courier::{Amqp, MemoryBroker, Properties};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

/// Installs a subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A facade wired to a fresh in-memory broker.
pub fn memory_amqp() -> (Amqp, MemoryBroker) {
    init_tracing();
    let broker = MemoryBroker::new();
    let amqp = Amqp::with_connector(Properties::new(), Arc::new(broker.clone()));
    (amqp, broker)
}

/// Builds an override map from `(key, value)` pairs.
pub fn overrides<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

pub fn none() -> Map<String, Value> {
    Map::new()
}
