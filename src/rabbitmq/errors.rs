// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum AmqpError {
    /// A required property is missing or malformed. Raised before any network call.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("RabbitMQ connection error: {0}")]
    Connection(String),

    /// The broker refused a declare, bind or publish (precondition-failed, not-found, ...).
    #[error("RabbitMQ protocol error: {0}")]
    Protocol(String),

    /// Unrecoverable channel failure while waiting for deliveries or confirms.
    #[error("RabbitMQ transport error: {0}")]
    Transport(String),

    #[error("Cannot correlate RPC reply: {0}")]
    CannotCorrelate(String),

    #[error("Publisher confirms are not enabled on this channel")]
    ConfirmsNotEnabled,

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("Message handler error: {0}")]
    Handler(#[from] anyhow::Error),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, AmqpError>;

impl AmqpError {
    pub fn configuration(message: impl Into<String>) -> Self {
        AmqpError::Configuration(message.into())
    }

    pub fn is_fatal_connection(&self) -> bool {
        matches!(self, AmqpError::Connection(_))
    }
}

// Converting from lapin errors
impl From<LapinError> for AmqpError {
    fn from(error: LapinError) -> Self {
        match error {
            LapinError::ProtocolError(amqp_error) => AmqpError::Protocol(amqp_error.to_string()),
            LapinError::IOError(io_error) => AmqpError::Connection(io_error.to_string()),
            LapinError::InvalidConnectionState(state) => {
                AmqpError::Connection(format!("invalid connection state: {:?}", state))
            }
            other => AmqpError::Transport(other.to_string()),
        }
    }
}

impl From<Elapsed> for AmqpError {
    fn from(_: Elapsed) -> Self {
        AmqpError::Connection("Connection timed out".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_maps_to_connection_error() {
        let err = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(async {
                tokio::time::timeout(
                    std::time::Duration::from_millis(1),
                    futures::future::pending::<()>(),
                )
                .await
                .unwrap_err()
            });

        let converted: AmqpError = err.into();
        assert!(converted.is_fatal_connection());
        assert_eq!(
            converted.to_string(),
            "RabbitMQ connection error: Connection timed out"
        );
    }

    #[test]
    fn serde_errors_convert() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let converted: AmqpError = err.into();
        assert!(matches!(converted, AmqpError::Serialization(_)));
    }
}
