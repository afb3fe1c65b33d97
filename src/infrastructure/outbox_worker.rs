//! Outbox worker - publishes queued client updates and push notifications
//!
//! Best-effort: each message gets up to `max_attempts` publishes, each bounded
//! by `publish_timeout`, with full-jitter backoff between attempts. Failures
//! are logged and never reach the handler that queued the message.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::application::dto::OutboundMessage;
use crate::application::ports::outbound::{ClientUpdatePublisher, PushNotificationPublisher};
use crate::application::services::OutboxReceiver;
use crate::infrastructure::config::OutboxConfig;

const BASE_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct Publishers {
    client: Arc<dyn ClientUpdatePublisher>,
    push: Arc<dyn PushNotificationPublisher>,
}

impl Publishers {
    async fn publish(&self, message: &OutboundMessage) -> anyhow::Result<()> {
        match message {
            OutboundMessage::Client(update) => self.client.publish_client_update(update).await,
            OutboundMessage::Push(push) => self.push.publish_push(push).await,
        }
    }
}

pub struct OutboxWorker {
    publishers: Publishers,
    config: OutboxConfig,
    base_backoff: Duration,
}

impl OutboxWorker {
    pub fn new(
        client: Arc<dyn ClientUpdatePublisher>,
        push: Arc<dyn PushNotificationPublisher>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            publishers: Publishers { client, push },
            config,
            base_backoff: BASE_BACKOFF,
        }
    }

    #[cfg(test)]
    fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    /// Publish until cancelled, then drain what is already queued
    pub async fn run(self, mut receiver: OutboxReceiver, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let tracker = TaskTracker::new();
        info!(workers = self.config.workers, "Outbox worker started");

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.spawn_publish(&semaphore, &tracker, message).await;
        }

        // Stop intake; anything already queued is still delivered
        receiver.close();
        let mut drained = 0usize;
        while let Some(message) = receiver.recv().await {
            drained += 1;
            self.spawn_publish(&semaphore, &tracker, message).await;
        }
        if drained > 0 {
            info!(drained, "Draining outbox before shutdown");
        }

        tracker.close();
        tracker.wait().await;
        info!("Outbox worker stopped");
    }

    async fn spawn_publish(
        &self,
        semaphore: &Arc<Semaphore>,
        tracker: &TaskTracker,
        message: OutboundMessage,
    ) {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            return;
        };
        let publishers = self.publishers.clone();
        let config = self.config.clone();
        let base = self.base_backoff;
        tracker.spawn(async move {
            let _permit = permit;
            deliver(&publishers, &message, &config, base).await;
        });
    }
}

async fn deliver(
    publishers: &Publishers,
    message: &OutboundMessage,
    config: &OutboxConfig,
    base: Duration,
) {
    let channel = message.channel();
    let max_attempts = config.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let outcome = match tokio::time::timeout(config.publish_timeout, publishers.publish(message)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow::anyhow!("publish timed out")),
        };
        match outcome {
            Ok(()) => {
                debug!(channel, attempt, "Outbound message published");
                return;
            }
            Err(e) if attempt < max_attempts => {
                warn!(channel, attempt, error = %e, "Outbound publish failed, retrying");
                tokio::time::sleep(jittered_backoff(base, attempt)).await;
            }
            Err(e) => {
                error!(channel, attempts = max_attempts, error = %e, "Giving up on outbound message");
            }
        }
    }
}

/// Full jitter: uniform in `[0, min(base * 2^(attempt-1), MAX_BACKOFF)]`
fn jittered_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    let cap = base.saturating_mul(factor).min(MAX_BACKOFF);
    let cap_ms = cap.as_millis() as u64;
    if cap_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::application::dto::{ClientUpdate, PushNotification};
    use crate::application::services::Outbox;
    use crate::domain::entities::PublishedStory;
    use crate::domain::value_objects::UserId;

    /// Fails the first `failures` publishes, then records
    struct FlakyPublisher {
        failures: AtomicU32,
        calls: AtomicU32,
        published: Mutex<Vec<String>>,
    }

    impl FlakyPublisher {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                published: Mutex::new(Vec::new()),
            })
        }

        fn attempt(&self, label: String) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("gateway unavailable");
            }
            self.published.lock().unwrap().push(label);
            Ok(())
        }
    }

    #[async_trait]
    impl ClientUpdatePublisher for FlakyPublisher {
        async fn publish_client_update(&self, update: &ClientUpdate) -> anyhow::Result<()> {
            self.attempt(update.status.clone())
        }
    }

    #[async_trait]
    impl PushNotificationPublisher for FlakyPublisher {
        async fn publish_push(&self, payload: &PushNotification) -> anyhow::Result<()> {
            self.attempt(payload.title.clone())
        }
    }

    fn config(max_attempts: u32) -> OutboxConfig {
        OutboxConfig {
            capacity: 16,
            workers: 2,
            publish_timeout: Duration::from_secs(1),
            max_attempts,
        }
    }

    fn worker(publisher: &Arc<FlakyPublisher>, max_attempts: u32) -> OutboxWorker {
        OutboxWorker::new(publisher.clone(), publisher.clone(), config(max_attempts))
            .with_base_backoff(Duration::from_millis(1))
    }

    fn story() -> PublishedStory {
        PublishedStory::new(UserId::new(), serde_json::json!({}), "en")
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let publisher = FlakyPublisher::new(2);
        let (outbox, receiver) = Outbox::channel(8);
        let cancel = CancellationToken::new();

        outbox.client_update(ClientUpdate::story(&story()));
        cancel.cancel();
        worker(&publisher, 3).run(receiver, cancel).await;

        assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_drop_the_message() {
        let publisher = FlakyPublisher::new(10);
        let (outbox, receiver) = Outbox::channel(8);
        let cancel = CancellationToken::new();

        outbox.push(PushNotification::story_ready(&story()));
        cancel.cancel();
        worker(&publisher, 2).run(receiver, cancel).await;

        assert_eq!(publisher.calls.load(Ordering::SeqCst), 2);
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_messages() {
        let publisher = FlakyPublisher::new(0);
        let (outbox, receiver) = Outbox::channel(8);
        let cancel = CancellationToken::new();
        let running = tokio::spawn(worker(&publisher, 1).run(receiver, cancel.clone()));

        let story = story();
        outbox.client_update(ClientUpdate::story(&story));
        outbox.push(PushNotification::story_ready(&story));
        outbox.client_update(ClientUpdate::story(&story));
        cancel.cancel();
        running.await.unwrap();

        assert_eq!(publisher.published.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_backoff_stays_under_cap() {
        for attempt in 1..40 {
            assert!(jittered_backoff(Duration::from_millis(200), attempt) <= MAX_BACKOFF);
        }
        assert_eq!(jittered_backoff(Duration::ZERO, 3), Duration::ZERO);
    }
}
