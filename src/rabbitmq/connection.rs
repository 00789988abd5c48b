use std::sync::Arc;

use tracing::{debug, info, warn};

use super::errors::{AmqpError, Result};
use super::transport::{AmqpChannel, AmqpConnection, Connector};
use crate::config::ConnectionConfig;

/// Owns exactly one connection and the one channel opened on it.
///
/// Connecting is idempotent and lazy; a failed connect is reported as-is,
/// retrying is left to the caller.
pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    connection: Option<Box<dyn AmqpConnection>>,
    channel: Option<Box<dyn AmqpChannel>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        ConnectionManager {
            config,
            connector,
            connection: None,
            channel: None,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        let connection_open = self.connection.as_ref().is_some_and(|conn| conn.is_open());
        let channel_open = self.channel.as_ref().is_some_and(|channel| channel.is_open());
        connection_open && channel_open
    }

    /// Opens the connection and its channel unless both are already live.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if self.connection.is_some() || self.channel.is_some() {
            debug!("Discarding stale connection before reconnecting");
            self.disconnect().await;
        }

        info!(
            host = %self.config.host,
            port = self.config.port,
            vhost = %self.config.vhost,
            tls = self.config.is_tls(),
            "Connecting to RabbitMQ"
        );

        let mut connection = tokio::time::timeout(
            self.config.connection_timeout,
            self.connector.connect(&self.config),
        )
        .await??;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    warn!("Failed to close connection after channel error: {}", close_err);
                }
                return Err(err);
            }
        };

        info!("Successfully connected to RabbitMQ");
        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }

    /// The session's channel, connecting first if needed.
    pub async fn channel(&mut self) -> Result<&mut dyn AmqpChannel> {
        self.connect().await?;
        match self.channel.as_mut() {
            Some(channel) => Ok(&mut **channel),
            None => Err(AmqpError::Connection("No channel available".to_string())),
        }
    }

    pub async fn connection(&mut self) -> Result<&mut dyn AmqpConnection> {
        self.connect().await?;
        match self.connection.as_mut() {
            Some(connection) => Ok(&mut **connection),
            None => Err(AmqpError::Connection("No active connection".to_string())),
        }
    }

    /// Closes the channel, then the connection. Close-time errors are logged and dropped.
    pub async fn disconnect(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(err) = channel.close().await {
                warn!("Ignoring error while closing channel: {}", err);
            }
        }
        if let Some(mut connection) = self.connection.take() {
            info!("Closing RabbitMQ connection gracefully");
            if let Err(err) = connection.close().await {
                warn!("Ignoring error while closing connection: {}", err);
            }
        }
    }
}
