//! Concurrency-bounded consumer loop
//!
//! Receives deliveries from the transport and processes at most
//! `concurrency` of them at once. Every delivery is settled exactly once:
//! acked when processing completed, rejected (dead-lettered, never requeued)
//! when it failed or ran past the handling deadline.
//!
//! Shutdown stops receiving, waits for in-flight deliveries to settle, then
//! closes the transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::application::ports::outbound::{Delivery, DeliveryQueuePort, QueueError};
use crate::application::services::NotificationProcessor;
use crate::infrastructure::config::ConsumerConfig;

pub struct NotificationConsumer {
    queue: Arc<dyn DeliveryQueuePort>,
    processor: NotificationProcessor,
    config: ConsumerConfig,
    in_flight: Arc<AtomicUsize>,
}

impl NotificationConsumer {
    pub fn new(
        queue: Arc<dyn DeliveryQueuePort>,
        processor: NotificationProcessor,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared gauge of deliveries currently being processed
    pub fn in_flight(&self) -> Arc<AtomicUsize> {
        self.in_flight.clone()
    }

    pub async fn run(self, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let tracker = TaskTracker::new();
        info!(concurrency = self.config.concurrency, "Notification consumer started");

        loop {
            // Wait for capacity before taking a delivery off the transport
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Bounded wait, so cancellation is noticed within one poll
            let delivery = match self.queue.receive(self.config.receive_poll).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    continue;
                }
                Err(QueueError::Closed) => {
                    warn!("Delivery queue closed, consumer stopping");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to receive delivery");
                    drop(permit);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.receive_poll) => continue,
                    }
                }
            };

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let queue = self.queue.clone();
            let processor = self.processor.clone();
            let in_flight = self.in_flight.clone();
            let timeout = self.config.handling_timeout;
            let span = info_span!(
                "delivery",
                delivery_tag = delivery.tag,
                correlation_id = ?delivery.correlation_id
            );

            tracker.spawn(
                async move {
                    let _permit = permit;
                    settle(queue.as_ref(), &processor, delivery, timeout).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                .instrument(span),
            );
        }

        tracker.close();
        info!(
            in_flight = self.in_flight.load(Ordering::SeqCst),
            "Consumer stopping, waiting for in-flight deliveries"
        );
        tracker.wait().await;
        self.queue.close().await;
        info!("Notification consumer stopped");
    }
}

async fn settle(
    queue: &dyn DeliveryQueuePort,
    processor: &NotificationProcessor,
    delivery: Delivery,
    timeout: Duration,
) {
    let tag = delivery.tag;
    let settled = match tokio::time::timeout(timeout, processor.process(&delivery)).await {
        Ok(Ok(handled)) => {
            debug!(?handled, "Delivery processed");
            queue.ack(tag).await
        }
        Ok(Err(e)) => {
            error!(error = %e, retryable = e.is_retryable(), "Delivery processing failed");
            queue.reject(tag, &e.to_string()).await
        }
        Err(_) => {
            error!(timeout_secs = timeout.as_secs(), "Delivery processing timed out");
            queue.reject(tag, "handling timed out").await
        }
    };

    if let Err(e) = settled {
        error!(error = %e, "Failed to settle delivery");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::application::ports::outbound::TaskPublisher;
    use crate::application::services::handlers::fixtures::Harness;
    use crate::application::services::{IdempotencyGuard, Outbox, StageHandlers, TaskDispatcher};
    use crate::domain::entities::GenerationTask;
    use crate::domain::value_objects::{GenerationStep, PendingCounters, TaskType};
    use crate::infrastructure::idempotency::InMemoryIdempotencyStore;
    use crate::infrastructure::queues::InMemoryDeliveryQueue;

    fn consumer(queue: &InMemoryDeliveryQueue, h: &Harness) -> NotificationConsumer {
        consumer_with(queue, h.handlers.clone(), 2, Duration::from_secs(5))
    }

    fn consumer_with(
        queue: &InMemoryDeliveryQueue,
        handlers: StageHandlers,
        concurrency: usize,
        handling_timeout: Duration,
    ) -> NotificationConsumer {
        let guard = IdempotencyGuard::new(Arc::new(InMemoryIdempotencyStore::new()));
        let processor = NotificationProcessor::new(guard, handlers);
        let config = ConsumerConfig {
            concurrency,
            handling_timeout,
            receive_poll: Duration::from_millis(10),
        };
        NotificationConsumer::new(Arc::new(queue.clone()), processor, config)
    }

    /// Holds every publish until the test opens the gate
    struct GatedPublisher {
        current: AtomicUsize,
        peak: AtomicUsize,
        gate: Semaphore,
    }

    impl GatedPublisher {
        fn closed() -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                gate: Semaphore::new(0),
            })
        }
    }

    #[async_trait]
    impl TaskPublisher for GatedPublisher {
        async fn publish_task(&self, _task: &GenerationTask) -> anyhow::Result<()> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let permit = self.gate.acquire().await?;
            permit.forget();
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Handlers whose follow-up publishes go through `publisher`
    fn gated_handlers(h: &Harness, publisher: Arc<GatedPublisher>) -> StageHandlers {
        let (outbox, _receiver) = Outbox::channel(64);
        let dispatcher = TaskDispatcher::new(publisher, Duration::from_secs(30));
        StageHandlers::new(h.store.clone(), dispatcher, outbox)
    }

    /// Enqueue a successful moderation result for a fresh story
    async fn enqueue_moderation(h: &Harness, queue: &InMemoryDeliveryQueue) {
        let story = h.story_at(GenerationStep::Moderation, PendingCounters::default()).await;
        let n = h
            .success(TaskType::ContentModeration, story.id, r#"{"ac": false}"#)
            .await;
        let body = serde_json::json!({
            "task_id": n.task_id.as_str(),
            "task_type": "content_moderation",
            "status": "success",
            "published_story_id": story.id.to_string(),
        });
        queue
            .enqueue(None, serde_json::to_vec(&body).unwrap())
            .await
            .unwrap();
    }

    async fn wait_until_settled(queue: &InMemoryDeliveryQueue) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.depth().await.unwrap() > 0 || queue.in_flight().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_each_delivery_is_settled_once() {
        let h = Harness::new();
        let queue = InMemoryDeliveryQueue::new();
        let consumer = consumer(&queue, &h);
        let gauge = consumer.in_flight();
        let cancel = CancellationToken::new();
        let running = tokio::spawn(consumer.run(cancel.clone()));

        queue.enqueue(None, b"not json".to_vec()).await.unwrap();
        let missing_target = serde_json::json!({
            "task_id": "t-1",
            "task_type": "setup",
            "status": "success",
        });
        queue
            .enqueue(Some("c-1".into()), serde_json::to_vec(&missing_target).unwrap())
            .await
            .unwrap();

        wait_until_settled(&queue).await;
        cancel.cancel();
        running.await.unwrap();

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].1.contains("undecodable"));
        assert_eq!(gauge.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_transport() {
        let h = Harness::new();
        let queue = InMemoryDeliveryQueue::new();
        let cancel = CancellationToken::new();
        let running = tokio::spawn(consumer(&queue, &h).run(cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            queue.enqueue(None, Vec::new()).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_in_flight_processing_is_capped_at_concurrency() {
        let h = Harness::new();
        let queue = InMemoryDeliveryQueue::new();
        let publisher = GatedPublisher::closed();
        let consumer = consumer_with(
            &queue,
            gated_handlers(&h, publisher.clone()),
            2,
            Duration::from_secs(10),
        );
        for _ in 0..5 {
            enqueue_moderation(&h, &queue).await;
        }
        let cancel = CancellationToken::new();
        let running = tokio::spawn(consumer.run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while publisher.current.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        // Both slots are held by blocked handlers, so nothing else leaves the transport
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(publisher.current.load(Ordering::SeqCst), 2);
        assert_eq!(queue.depth().await.unwrap(), 3);

        publisher.gate.add_permits(5);
        wait_until_settled(&queue).await;
        cancel.cancel();
        running.await.unwrap();

        assert_eq!(publisher.peak.load(Ordering::SeqCst), 2);
        assert!(queue.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_handler_past_deadline_is_dead_lettered() {
        let h = Harness::new();
        let queue = InMemoryDeliveryQueue::new();
        let publisher = GatedPublisher::closed();
        let consumer = consumer_with(
            &queue,
            gated_handlers(&h, publisher.clone()),
            1,
            Duration::from_millis(100),
        );
        let gauge = consumer.in_flight();
        enqueue_moderation(&h, &queue).await;

        let cancel = CancellationToken::new();
        let running = tokio::spawn(consumer.run(cancel.clone()));
        wait_until_settled(&queue).await;
        cancel.cancel();
        running.await.unwrap();

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1, "handling timed out");
        assert_eq!(gauge.load(Ordering::SeqCst), 0);
    }
}
