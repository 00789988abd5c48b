// src/config.rs
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::rabbitmq::{AmqpError, Result};

/// Property names understood by the core, grouped per subsystem.
///
/// Keys outside these groups are carried along untouched; the argument-table
/// keys (`exchange_properties`, `queue_properties`) are handed to the broker
/// as opaque arguments.
pub mod keys {
    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const VHOST: &str = "vhost";
    pub const CONNECT_OPTIONS: &str = "connect_options";
    pub const SSL_OPTIONS: &str = "ssl_options";

    pub const EXCHANGE: &str = "exchange";
    pub const EXCHANGE_TYPE: &str = "exchange_type";
    pub const EXCHANGE_PASSIVE: &str = "exchange_passive";
    pub const EXCHANGE_DURABLE: &str = "exchange_durable";
    pub const EXCHANGE_AUTO_DELETE: &str = "exchange_auto_delete";
    pub const EXCHANGE_INTERNAL: &str = "exchange_internal";
    pub const EXCHANGE_NOWAIT: &str = "exchange_nowait";
    pub const EXCHANGE_PROPERTIES: &str = "exchange_properties";

    pub const QUEUE: &str = "queue";
    pub const QUEUE_FORCE_DECLARE: &str = "queue_force_declare";
    pub const QUEUE_PASSIVE: &str = "queue_passive";
    pub const QUEUE_DURABLE: &str = "queue_durable";
    pub const QUEUE_EXCLUSIVE: &str = "queue_exclusive";
    pub const QUEUE_AUTO_DELETE: &str = "queue_auto_delete";
    pub const QUEUE_NOWAIT: &str = "queue_nowait";
    pub const QUEUE_PROPERTIES: &str = "queue_properties";
    pub const ROUTING: &str = "routing";

    pub const CONSUMER_TAG: &str = "consumer_tag";
    pub const CONSUMER_NO_LOCAL: &str = "consumer_no_local";
    pub const CONSUMER_NO_ACK: &str = "consumer_no_ack";
    pub const CONSUMER_EXCLUSIVE: &str = "consumer_exclusive";
    pub const CONSUMER_NOWAIT: &str = "consumer_nowait";
    pub const TIMEOUT: &str = "timeout";
    pub const PERSISTENT: &str = "persistent";
    pub const SHUTDOWN_SENTINEL: &str = "shutdown_sentinel";

    pub const QOS: &str = "qos";
    pub const QOS_PREFETCH_SIZE: &str = "qos_prefetch_size";
    pub const QOS_PREFETCH_COUNT: &str = "qos_prefetch_count";
    pub const QOS_GLOBAL: &str = "qos_a_global";

    pub const MANDATORY: &str = "mandatory";
    pub const PUBLISHER_CONFIRMS: &str = "publisher_confirms";
    pub const WAIT_FOR_CONFIRMS: &str = "wait_for_confirms";
    pub const PUBLISH_TIMEOUT: &str = "publish_timeout";

    pub const CONNECTION: &[&str] = &[
        HOST,
        PORT,
        USERNAME,
        PASSWORD,
        VHOST,
        CONNECT_OPTIONS,
        SSL_OPTIONS,
    ];
    pub const EXCHANGE_KEYS: &[&str] = &[
        EXCHANGE,
        EXCHANGE_TYPE,
        EXCHANGE_PASSIVE,
        EXCHANGE_DURABLE,
        EXCHANGE_AUTO_DELETE,
        EXCHANGE_INTERNAL,
        EXCHANGE_NOWAIT,
        EXCHANGE_PROPERTIES,
    ];
    pub const QUEUE_KEYS: &[&str] = &[
        QUEUE,
        QUEUE_FORCE_DECLARE,
        QUEUE_PASSIVE,
        QUEUE_DURABLE,
        QUEUE_EXCLUSIVE,
        QUEUE_AUTO_DELETE,
        QUEUE_NOWAIT,
        QUEUE_PROPERTIES,
        ROUTING,
    ];
    pub const CONSUMER: &[&str] = &[
        CONSUMER_TAG,
        CONSUMER_NO_LOCAL,
        CONSUMER_NO_ACK,
        CONSUMER_EXCLUSIVE,
        CONSUMER_NOWAIT,
        TIMEOUT,
        PERSISTENT,
        SHUTDOWN_SENTINEL,
    ];
    pub const QOS_KEYS: &[&str] = &[QOS, QOS_PREFETCH_SIZE, QOS_PREFETCH_COUNT, QOS_GLOBAL];
    pub const PUBLISH: &[&str] = &[
        MANDATORY,
        PUBLISHER_CONFIRMS,
        WAIT_FOR_CONFIRMS,
        PUBLISH_TIMEOUT,
    ];

    /// Every key the core reads, in subsystem order.
    pub fn all() -> impl Iterator<Item = &'static str> {
        CONNECTION
            .iter()
            .chain(EXCHANGE_KEYS)
            .chain(QUEUE_KEYS)
            .chain(CONSUMER)
            .chain(QOS_KEYS)
            .chain(PUBLISH)
            .copied()
    }
}

const ENV_PREFIX: &str = "AMQP_";

fn default_layer() -> Map<String, Value> {
    let defaults = json!({
        "host": "localhost",
        "port": 5672,
        "username": "guest",
        "password": "guest",
        "vhost": "/",
        "connect_options": {},
        "ssl_options": {},

        "exchange": "amq.topic",
        "exchange_type": "topic",
        "exchange_passive": false,
        "exchange_durable": true,
        "exchange_auto_delete": false,
        "exchange_internal": false,
        "exchange_nowait": false,
        "exchange_properties": {},

        "queue_force_declare": false,
        "queue_passive": false,
        "queue_durable": true,
        "queue_exclusive": false,
        "queue_auto_delete": false,
        "queue_nowait": false,
        "queue_properties": { "x-ha-policy": ["S", "all"] },

        "consumer_tag": "",
        "consumer_no_local": false,
        "consumer_no_ack": false,
        "consumer_exclusive": false,
        "consumer_nowait": false,
        "timeout": 0,
        "persistent": false,
        "shutdown_sentinel": "quit",

        "qos": false,
        "qos_prefetch_size": 0,
        "qos_prefetch_count": 1,
        "qos_a_global": false,

        "mandatory": false,
        "publisher_confirms": false,
        "wait_for_confirms": true,
        "publish_timeout": 30
    });

    match defaults {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Layered property map: defaults, then an optional profile, then per-call overrides.
///
/// Lookups walk the layers from the most specific one down. An explicit JSON
/// `null` in a higher layer shadows the value below it.
#[derive(Debug, Clone)]
pub struct Properties {
    defaults: Map<String, Value>,
    profile: Map<String, Value>,
    overrides: Map<String, Value>,
}

impl Default for Properties {
    fn default() -> Self {
        Self::new()
    }
}

impl Properties {
    pub fn new() -> Self {
        Self {
            defaults: default_layer(),
            profile: Map::new(),
            overrides: Map::new(),
        }
    }

    /// Properties with the given map as the profile layer.
    pub fn with_profile(profile: Map<String, Value>) -> Self {
        Self {
            profile,
            ..Self::new()
        }
    }

    /// Builds a profile layer from `AMQP_<KEY>` environment variables (a `.env` file is honoured).
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let mut profile = Map::new();
        for key in keys::all() {
            let var = format!("{}{}", ENV_PREFIX, key.to_uppercase());
            if let Ok(raw) = env::var(&var) {
                debug!(variable = %var, "Loaded property from environment");
                profile.insert(key.to_string(), parse_env_value(&raw));
            }
        }

        Self::with_profile(profile)
    }

    /// Returns a copy with `overrides` merged on top of the existing overrides.
    pub fn merged(&self, overrides: &Map<String, Value>) -> Self {
        let mut merged = self.clone();
        merged.merge(overrides);
        merged
    }

    pub fn merge(&mut self, overrides: &Map<String, Value>) {
        for (key, value) in overrides {
            self.overrides.insert(key.clone(), value.clone());
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.overrides.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        [&self.overrides, &self.profile, &self.defaults]
            .into_iter()
            .find_map(|layer| layer.get(key))
            .filter(|value| !value.is_null())
    }

    /// Typed lookup falling back to `default` when the key is absent or has the wrong shape.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or(default)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get_or(key, false)
    }

    pub fn get_map(&self, key: &str) -> Map<String, Value> {
        match self.get(key) {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    /// A string property that must be present and non-empty.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        match self.get_str(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(AmqpError::configuration(format!(
                "missing required property '{}'",
                key
            ))),
        }
    }
}

fn parse_env_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if !value.is_string() => value,
        _ => Value::String(raw.to_string()),
    }
}

/// TLS material for an `amqps` connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// PEM bundle of trusted CA certificates.
    pub ca_file: Option<PathBuf>,
    /// PKCS#12 client identity.
    pub client_identity: Option<PathBuf>,
    pub passphrase: Option<String>,
}

impl TlsOptions {
    fn from_map(options: &Map<String, Value>) -> Self {
        let path = |key: &str| options.get(key).and_then(Value::as_str).map(PathBuf::from);
        Self {
            ca_file: path("cafile"),
            client_identity: path("local_cert"),
            passphrase: options
                .get("passphrase")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

/// Everything needed to open one connection. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub tls: Option<TlsOptions>,
    pub connection_timeout: Duration,
    pub heartbeat: u16,
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_heartbeat() -> u16 {
    60
}

impl ConnectionConfig {
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let host = properties.require_str(keys::HOST)?.to_string();
        let connect_options = properties.get_map(keys::CONNECT_OPTIONS);
        let ssl_options = properties.get_map(keys::SSL_OPTIONS);

        let connection_timeout = connect_options
            .get("connection_timeout")
            .and_then(Value::as_u64)
            .unwrap_or_else(default_connection_timeout);
        let heartbeat = connect_options
            .get("heartbeat")
            .and_then(Value::as_u64)
            .and_then(|secs| u16::try_from(secs).ok())
            .unwrap_or_else(default_heartbeat);

        Ok(Self {
            host,
            port: properties.get_or(keys::PORT, 5672),
            username: properties.get_or(keys::USERNAME, "guest".to_string()),
            password: properties.get_or(keys::PASSWORD, "guest".to_string()),
            vhost: properties.get_or(keys::VHOST, "/".to_string()),
            tls: if ssl_options.is_empty() {
                None
            } else {
                Some(TlsOptions::from_map(&ssl_options))
            },
            connection_timeout: Duration::from_secs(connection_timeout),
            heartbeat,
        })
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}
