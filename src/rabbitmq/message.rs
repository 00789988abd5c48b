use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// AMQP basic properties carried next to a payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    #[serde(default)]
    pub headers: Map<String, Value>,
}

impl MessageProperties {
    /// Reads the recognised property names from a flat map; unrecognised entries are ignored.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let string = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
        let small = |key: &str| {
            map.get(key)
                .and_then(Value::as_u64)
                .and_then(|v| u8::try_from(v).ok())
        };

        Self {
            content_type: string("content_type"),
            content_encoding: string("content_encoding"),
            delivery_mode: small("delivery_mode"),
            priority: small("priority"),
            correlation_id: string("correlation_id"),
            reply_to: string("reply_to"),
            expiration: map.get("expiration").and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }),
            message_id: string("message_id"),
            timestamp: map.get("timestamp").and_then(Value::as_u64),
            kind: string("type"),
            user_id: string("user_id"),
            app_id: string("app_id"),
            headers: match map.get("application_headers").or_else(|| map.get("headers")) {
                Some(Value::Object(headers)) => headers.clone(),
                _ => Map::new(),
            },
        }
    }
}

/// An immutable payload plus its property bag.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    body: Vec<u8>,
    properties: MessageProperties,
}

impl Message {
    /// A message with the default content type and persistent delivery mode.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self::with_properties(body, MessageProperties::default())
    }

    /// Builds a message from a flat property map, filling in the defaults for anything left out.
    pub fn from_properties(body: impl Into<Vec<u8>>, properties: &Map<String, Value>) -> Self {
        Self::with_properties(body, MessageProperties::from_map(properties))
    }

    pub fn with_properties(body: impl Into<Vec<u8>>, mut properties: MessageProperties) -> Self {
        properties
            .content_type
            .get_or_insert_with(|| DEFAULT_CONTENT_TYPE.to_string());
        properties
            .delivery_mode
            .get_or_insert(PERSISTENT_DELIVERY_MODE);
        Self {
            body: body.into(),
            properties,
        }
    }

    /// JSON-encodes `payload` and tags the message as `application/json`.
    pub fn json<T: Serialize>(payload: &T) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::to_vec(payload)?).with_content_type("application/json"))
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    pub fn with_delivery_mode(mut self, delivery_mode: u8) -> Self {
        self.properties.delivery_mode = Some(delivery_mode);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.properties.priority = Some(priority);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    /// Per-message TTL in milliseconds.
    pub fn with_expiration(mut self, millis: u64) -> Self {
        self.properties.expiration = Some(millis.to_string());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.properties.message_id = Some(message_id.into());
        self
    }

    pub fn with_current_timestamp(mut self) -> Self {
        self.properties.timestamp = Some(Utc::now().timestamp() as u64);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.headers.insert(name.into(), value.into());
        self
    }
}

/// A message handed to a consumer, with its broker-side routing metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message: Message,
}

impl Delivery {
    pub fn body(&self) -> &[u8] {
        self.message.body()
    }
}
