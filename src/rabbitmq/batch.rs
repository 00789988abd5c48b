use tracing::debug;

use super::errors::Result;
use super::message::Message;
use super::transport::AmqpChannel;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub routing_key: String,
    pub message: Message,
}

/// Ordered buffer of pending publishes, owned by one session.
///
/// The buffer is flushed with a single channel call and cleared only once that
/// call has succeeded, so a failed flush can be retried as a whole.
#[derive(Debug, Default)]
pub struct BatchManager {
    items: Vec<BatchItem>,
}

impl BatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, routing_key: impl Into<String>, message: Message) {
        self.items.push(BatchItem {
            routing_key: routing_key.into(),
            message,
        });
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[BatchItem] {
        &self.items
    }

    /// Publishes every buffered item to `exchange` and returns how many were sent.
    pub async fn flush(&mut self, channel: &mut dyn AmqpChannel, exchange: &str) -> Result<usize> {
        if self.items.is_empty() {
            return Ok(0);
        }

        debug!(exchange = %exchange, size = self.items.len(), "Flushing publish batch");
        channel.publish_batch(exchange, &self.items).await?;

        let flushed = self.items.len();
        self.items.clear();
        Ok(flushed)
    }
}
