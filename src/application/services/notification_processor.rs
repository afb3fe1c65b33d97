//! Notification Processor - one delivery in, one ack/reject decision out
//!
//! Decode, validate, admit, route, handle. Everything that completes the
//! delivery (success, validation failure, stale or duplicate notification,
//! absorbed domain failure) is `Ok`; only errors the consumer should reject
//! are `Err`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::application::ports::outbound::{Delivery, RepoError};
use crate::application::services::handlers::StageHandlers;
use crate::application::services::idempotency_guard::IdempotencyGuard;
use crate::application::services::notification_router::{resolve_target, route, Route, Target};
use crate::domain::entities::Notification;

/// How a delivery was completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The handler changed state
    Applied,
    /// The target had moved past the stage this notification reports on
    Stale,
    /// The task id was already admitted
    Duplicate,
    /// The notification failed validation
    Invalid,
    /// Task type this build does not handle
    Ignored,
    /// A domain failure was recorded on the target entity
    Failed,
}

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("undecodable notification body: {0}")]
    Decode(String),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("state invariant violated: {0}")]
    Invariant(String),
}

impl ProcessingError {
    /// Whether a replay of the same delivery could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Repo(_))
    }
}

/// Outcome counters exposed on the status endpoint
#[derive(Debug, Default)]
pub struct ProcessingStats {
    applied: AtomicU64,
    stale: AtomicU64,
    duplicate: AtomicU64,
    invalid: AtomicU64,
    ignored: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub applied: u64,
    pub stale: u64,
    pub duplicate: u64,
    pub invalid: u64,
    pub ignored: u64,
    pub failed: u64,
    pub rejected: u64,
}

impl ProcessingStats {
    fn record(&self, outcome: &Result<Handled, ProcessingError>) {
        let counter = match outcome {
            Ok(Handled::Applied) => &self.applied,
            Ok(Handled::Stale) => &self.stale,
            Ok(Handled::Duplicate) => &self.duplicate,
            Ok(Handled::Invalid) => &self.invalid,
            Ok(Handled::Ignored) => &self.ignored,
            Ok(Handled::Failed) => &self.failed,
            Err(_) => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct NotificationProcessor {
    guard: IdempotencyGuard,
    handlers: StageHandlers,
    stats: Arc<ProcessingStats>,
}

impl NotificationProcessor {
    pub fn new(guard: IdempotencyGuard, handlers: StageHandlers) -> Self {
        Self {
            guard,
            handlers,
            stats: Arc::new(ProcessingStats::default()),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[instrument(skip(self, delivery), fields(delivery_tag = delivery.tag, correlation_id = ?delivery.correlation_id))]
    pub async fn process(&self, delivery: &Delivery) -> Result<Handled, ProcessingError> {
        let outcome = self.process_inner(delivery).await;
        self.stats.record(&outcome);
        outcome
    }

    async fn process_inner(&self, delivery: &Delivery) -> Result<Handled, ProcessingError> {
        let notification: Notification = serde_json::from_slice(&delivery.body)
            .map_err(|e| ProcessingError::Decode(e.to_string()))?;

        let target = match resolve_target(&notification) {
            Ok(target) => target,
            Err(e) => {
                warn!(task_id = %notification.task_id, task_type = %notification.task_type, error = %e, "Invalid notification");
                return Ok(Handled::Invalid);
            }
        };

        let task_id = notification.task_id.clone();
        if !self.guard.admit(&task_id).await? {
            info!(task_id = %task_id, "Duplicate notification, acknowledging");
            return Ok(Handled::Duplicate);
        }

        let outcome = self.dispatch(&notification, target).await;
        if let Err(e) = &outcome {
            if e.is_retryable() {
                self.guard.release(&task_id).await;
            }
        }
        outcome
    }

    async fn dispatch(
        &self,
        notification: &Notification,
        target: Target,
    ) -> Result<Handled, ProcessingError> {
        let route = match route(notification, target) {
            Ok(route) => route,
            Err(e) => {
                warn!(task_id = %notification.task_id, error = %e, "Notification cannot be routed");
                return Ok(Handled::Invalid);
            }
        };
        debug!(task_id = %notification.task_id, route = route.name(), "Routing notification");

        let h = &self.handlers;
        match route {
            Route::Draft(config_id) => h.handle_draft(notification, config_id).await,
            Route::Moderation(id) => h.handle_moderation(notification, id).await,
            Route::ProtagonistGoal(id) => h.handle_protagonist_goal(notification, id).await,
            Route::ScenePlanner(id) => h.handle_scene_planner(notification, id).await,
            Route::CharacterGeneration(id) => h.handle_character_generation(notification, id).await,
            Route::Setup(id) => h.handle_setup(notification, id).await,
            Route::Image { story_id, key } => h.handle_image(notification, story_id, key).await,
            Route::InitialScene(id) => h.handle_initial_scene(notification, id).await,
            Route::SessionScene {
                story_id,
                game_state_id,
                state_hash,
                game_over,
            } => {
                h.handle_session_scene(notification, story_id, game_state_id, &state_hash, game_over)
                    .await
            }
            Route::JsonGeneration(id) => h.handle_json_generation(notification, id).await,
            Route::Unknown(task_type) => {
                warn!(task_id = %notification.task_id, %task_type, "Unknown task type, acknowledging");
                Ok(Handled::Ignored)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::application::ports::outbound::{
        IdempotencyStorePort, StagedTaskRepository, TaskPublisher,
    };
    use crate::application::services::handlers::fixtures::*;
    use crate::application::services::outbox::Outbox;
    use crate::application::services::task_dispatcher::TaskDispatcher;
    use crate::domain::entities::GenerationTask;
    use crate::domain::value_objects::{
        GenerationStep, PendingCounters, PublishedStoryId, StoryStatus, TaskId, TaskType,
    };
    use crate::infrastructure::idempotency::InMemoryIdempotencyStore;

    fn delivery(body: serde_json::Value) -> Delivery {
        Delivery {
            tag: 1,
            correlation_id: Some("corr-1".to_string()),
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    fn processor(h: &Harness) -> (NotificationProcessor, Arc<InMemoryIdempotencyStore>) {
        let dedup = Arc::new(InMemoryIdempotencyStore::new());
        let processor = NotificationProcessor::new(IdempotencyGuard::new(dedup.clone()), h.handlers.clone());
        (processor, dedup)
    }

    #[tokio::test]
    async fn test_empty_target_is_acknowledged_without_admission() {
        let h = Harness::new();
        let (processor, dedup) = processor(&h);
        let d = delivery(serde_json::json!({
            "task_id": "task-1",
            "task_type": "setup",
            "status": "success",
            "published_story_id": "",
            "story_config_id": "",
        }));

        assert_eq!(processor.process(&d).await.unwrap(), Handled::Invalid);
        assert!(dedup.insert_if_absent(&TaskId::new("task-1")).await.unwrap());
        assert_eq!(processor.stats().invalid, 1);
    }

    #[tokio::test]
    async fn test_redelivery_is_processed_once() {
        let mut h = Harness::new();
        let (processor, _) = processor(&h);
        let story = h.story_at(GenerationStep::ProtagonistGoal, PendingCounters::default()).await;
        let n = h
            .success(TaskType::ProtagonistGoal, story.id, r#"{"res": "Escape"}"#)
            .await;
        let d = delivery(serde_json::to_value(&n).unwrap());

        assert_eq!(processor.process(&d).await.unwrap(), Handled::Applied);
        let messages_after_first = h.messages().len();
        assert_eq!(processor.process(&d).await.unwrap(), Handled::Duplicate);

        assert_eq!(h.publisher.types(), vec![TaskType::ScenePlanner]);
        assert!(h.messages().is_empty());
        assert_eq!(messages_after_first, 1);
        let stats = processor.stats();
        assert_eq!((stats.applied, stats.duplicate), (1, 1));
    }

    #[tokio::test]
    async fn test_undecodable_body_is_rejected() {
        let h = Harness::new();
        let (processor, _) = processor(&h);
        let d = Delivery {
            tag: 7,
            correlation_id: None,
            body: b"not json".to_vec(),
        };

        let err = processor.process(&d).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Decode(_)));
        assert!(!err.is_retryable());
        assert_eq!(processor.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_unknown_task_type_is_ignored() {
        let h = Harness::new();
        let (processor, _) = processor(&h);
        let d = delivery(serde_json::json!({
            "task_id": "task-9",
            "task_type": "image_upscale",
            "status": "success",
            "published_story_id": PublishedStoryId::new().to_string(),
        }));

        assert_eq!(processor.process(&d).await.unwrap(), Handled::Ignored);
    }

    #[tokio::test]
    async fn test_ready_story_ignores_late_setup() {
        let mut h = Harness::new();
        let (processor, _) = processor(&h);
        let story = h.story_at(GenerationStep::Complete, PendingCounters::default()).await;
        let n = h.success(TaskType::Setup, story.id, r#"{"chars": []}"#).await;

        let handled = processor
            .process(&delivery(serde_json::to_value(&n).unwrap()))
            .await
            .unwrap();

        assert_eq!(handled, Handled::Stale);
        assert_eq!(h.story(story.id).await.status(), StoryStatus::Ready);
        assert!(h.publisher.types().is_empty());
        assert!(h.messages().is_empty());
    }

    #[tokio::test]
    async fn test_missing_story_releases_admission() {
        let h = Harness::new();
        let (processor, dedup) = processor(&h);
        let n = h
            .success(TaskType::ContentModeration, PublishedStoryId::new(), r#"{"ac": false}"#)
            .await;

        let err = processor
            .process(&delivery(serde_json::to_value(&n).unwrap()))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(dedup.insert_if_absent(&n.task_id).await.unwrap());
    }

    struct FlakyPublisher {
        fail: AtomicBool,
        published: std::sync::Mutex<Vec<TaskType>>,
    }

    #[async_trait]
    impl TaskPublisher for FlakyPublisher {
        async fn publish_task(&self, task: &GenerationTask) -> anyhow::Result<()> {
            if self.fail.swap(false, Ordering::SeqCst) {
                anyhow::bail!("broker unavailable");
            }
            self.published.lock().unwrap().push(task.task_type);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_follow_up_survives_failed_publish() {
        let h = Harness::new();
        let publisher = Arc::new(FlakyPublisher {
            fail: AtomicBool::new(true),
            published: std::sync::Mutex::new(Vec::new()),
        });
        let dispatcher = TaskDispatcher::new(publisher.clone(), std::time::Duration::from_secs(1));
        let (outbox, _receiver) = Outbox::channel(16);
        let handlers = StageHandlers::new(h.store.clone(), dispatcher.clone(), outbox);
        let processor = NotificationProcessor::new(
            IdempotencyGuard::new(Arc::new(InMemoryIdempotencyStore::new())),
            handlers,
        );

        let story = h.story_at(GenerationStep::Moderation, PendingCounters::default()).await;
        let n = h
            .success(TaskType::ContentModeration, story.id, r#"{"ac": false}"#)
            .await;
        let d = delivery(serde_json::to_value(&n).unwrap());

        assert_eq!(processor.process(&d).await.unwrap(), Handled::Applied);
        assert_eq!(h.story(story.id).await.step(), GenerationStep::ProtagonistGoal);
        assert!(publisher.published.lock().unwrap().is_empty());

        // The redelivered notification is a duplicate; the staged task is what gets retried
        assert_eq!(processor.process(&d).await.unwrap(), Handled::Duplicate);
        let relayed = dispatcher
            .relay_staged(&*h.store, Utc::now(), 10)
            .await
            .unwrap();

        assert_eq!(relayed, 1);
        assert_eq!(
            publisher.published.lock().unwrap().as_slice(),
            &[TaskType::ProtagonistGoal]
        );
        assert!(h
            .store
            .list_staged_tasks(Utc::now(), 10)
            .await
            .unwrap()
            .is_empty());
    }
}
