//! In-memory delivery queue for development and testing
//!
//! Deliveries live in a deque until received, then in the in-flight map until
//! acked or rejected. Nothing survives a restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

use crate::application::ports::outbound::{Delivery, DeliveryQueuePort, DeliveryTag, QueueError};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Delivery>,
    in_flight: HashMap<DeliveryTag, Delivery>,
    dead_letters: Vec<(Delivery, String)>,
    next_tag: DeliveryTag,
    closed: bool,
}

/// In-memory delivery queue
#[derive(Clone, Default)]
pub struct InMemoryDeliveryQueue {
    state: Arc<RwLock<QueueState>>,
    notify: Arc<Notify>,
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn take_next(&self) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        let Some(delivery) = state.pending.pop_front() else {
            return Ok(None);
        };
        state.in_flight.insert(delivery.tag, delivery.clone());
        Ok(Some(delivery))
    }

    pub async fn in_flight(&self) -> usize {
        self.state.read().await.in_flight.len()
    }

    /// Rejected deliveries with their reasons
    pub async fn dead_letters(&self) -> Vec<(Delivery, String)> {
        self.state.read().await.dead_letters.clone()
    }
}

#[async_trait]
impl DeliveryQueuePort for InMemoryDeliveryQueue {
    async fn enqueue(
        &self,
        correlation_id: Option<String>,
        body: Vec<u8>,
    ) -> Result<DeliveryTag, QueueError> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.next_tag += 1;
        let tag = state.next_tag;
        state.pending.push_back(Delivery {
            tag,
            correlation_id,
            body,
        });
        drop(state); // Release the lock before notifying

        self.notify.notify_one();
        Ok(tag)
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.take_next().await? {
                return Ok(Some(delivery));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, self.notify.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        state
            .in_flight
            .remove(&tag)
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery(tag))
    }

    async fn reject(&self, tag: DeliveryTag, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let delivery = state
            .in_flight
            .remove(&tag)
            .ok_or(QueueError::UnknownDelivery(tag))?;
        state.dead_letters.push((delivery, reason.to_string()));
        Ok(())
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        Ok(self.state.read().await.pending.len())
    }

    async fn close(&self) {
        self.state.write().await.closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tags_are_monotonic_and_fifo() {
        let queue = InMemoryDeliveryQueue::new();
        let first = queue.enqueue(None, b"a".to_vec()).await.unwrap();
        let second = queue.enqueue(Some("c-2".into()), b"b".to_vec()).await.unwrap();
        assert!(second > first);

        let received = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(received.tag, first);
        assert_eq!(queue.depth().await.unwrap(), 1);
        assert_eq!(queue.in_flight().await, 1);
    }

    #[tokio::test]
    async fn test_receive_times_out_when_empty() {
        let queue = InMemoryDeliveryQueue::new();
        assert!(queue.receive(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_enqueue() {
        let queue = InMemoryDeliveryQueue::new();
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(None, b"late".to_vec()).await.unwrap();
        });

        let delivery = queue.receive(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(delivery.body, b"late");
    }

    #[tokio::test]
    async fn test_settling_twice_is_unknown() {
        let queue = InMemoryDeliveryQueue::new();
        queue.enqueue(None, b"x".to_vec()).await.unwrap();
        let delivery = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();

        queue.ack(delivery.tag).await.unwrap();
        assert!(matches!(
            queue.reject(delivery.tag, "late").await,
            Err(QueueError::UnknownDelivery(_))
        ));
        assert!(queue.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_reject_dead_letters_with_reason() {
        let queue = InMemoryDeliveryQueue::new();
        queue.enqueue(None, b"bad".to_vec()).await.unwrap();
        let delivery = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();

        queue.reject(delivery.tag, "undecodable").await.unwrap();
        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1, "undecodable");
    }

    #[tokio::test]
    async fn test_closed_queue_refuses_receive() {
        let queue = InMemoryDeliveryQueue::new();
        queue.close().await;
        assert!(matches!(
            queue.receive(Duration::from_millis(10)).await,
            Err(QueueError::Closed)
        ));
    }
}
