//! Delivery port - Message transport primitives used by the consumer loop

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Monotonic per-transport delivery tag
pub type DeliveryTag = u64;

/// One message handed over by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Database(String),

    #[error("delivery {0} is unknown or already settled")]
    UnknownDelivery(DeliveryTag),

    #[error("queue is closed")]
    Closed,
}

#[async_trait]
pub trait DeliveryQueuePort: Send + Sync {
    /// Publish a message body into the queue
    async fn enqueue(
        &self,
        correlation_id: Option<String>,
        body: Vec<u8>,
    ) -> Result<DeliveryTag, QueueError>;

    /// Wait up to `wait` for the next delivery
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Processing finished; the message is done
    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError>;

    /// Processing failed; hand the message to the dead-letter path without requeue
    async fn reject(&self, tag: DeliveryTag, reason: &str) -> Result<(), QueueError>;

    /// Messages waiting to be received
    async fn depth(&self) -> Result<usize, QueueError>;

    /// Release transport resources; further receives fail with `Closed`
    async fn close(&self);
}
