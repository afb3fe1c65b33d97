//! Per-stage notification handlers
//!
//! Each file adds the handlers for one part of the pipeline to
//! [`StageHandlers`]. Handlers share one shape: load the target and check it is
//! still waiting on this stage, turn failures into persisted error state,
//! commit the state change together with the follow-up tasks it calls for,
//! then publish those tasks and queue client/push messages.

mod characters;
mod draft;
mod images;
mod planner;
mod preflight;
mod scenes;
mod setup;

use std::sync::Arc;

use tracing::{info, warn};

use crate::application::dto::{ClientUpdate, PushNotification};
use crate::application::ports::outbound::{Store, StoreTransaction};
use crate::application::services::error_handler::ErrorHandler;
use crate::application::services::notification_processor::{Handled, ProcessingError};
use crate::application::services::outbox::Outbox;
use crate::application::services::step_manager::{atomic_transition, ensure_stage, StepError};
use crate::application::services::task_dispatcher::TaskDispatcher;
use crate::domain::entities::{GenerationTask, Notification, PublishedStory, StepTransition};
use crate::domain::value_objects::{GenerationStep, PublishedStoryId, StoryStatus};

/// Worker output for one task, or why there is none
enum Generated {
    Text(String),
    Failed(String),
}

#[derive(Clone)]
pub struct StageHandlers {
    store: Arc<dyn Store>,
    dispatcher: TaskDispatcher,
    outbox: Outbox,
    errors: ErrorHandler,
}

impl StageHandlers {
    pub fn new(store: Arc<dyn Store>, dispatcher: TaskDispatcher, outbox: Outbox) -> Self {
        let errors = ErrorHandler::new(store.clone(), outbox.clone());
        Self {
            store,
            dispatcher,
            outbox,
            errors,
        }
    }

    /// Load a story that must still be waiting on `expected`.
    ///
    /// A missing story is a retryable storage error; a story that moved on or
    /// failed yields `None`.
    async fn load_story_at(
        &self,
        story_id: PublishedStoryId,
        expected: GenerationStep,
    ) -> Result<Option<PublishedStory>, ProcessingError> {
        let story = self.store.get_story(story_id).await?;
        settle(ensure_stage(&story, expected).map(|()| story))
    }

    /// Fetch the generated text behind a notification
    async fn generated_text(&self, notification: &Notification) -> Result<Generated, ProcessingError> {
        if !notification.is_success() {
            return Ok(Generated::Failed(notification.error_details()));
        }
        let result = match self
            .store
            .get_generation_result(&notification.task_id)
            .await
        {
            Ok(result) => result,
            Err(e) if e.is_not_found() => {
                return Ok(Generated::Failed(format!(
                    "no generation result stored for task {}",
                    notification.task_id
                )))
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(error) = result.error.filter(|e| !e.trim().is_empty()) {
            return Ok(Generated::Failed(error));
        }
        if result.generated_text.trim().is_empty() {
            return Ok(Generated::Failed(format!(
                "generation result for task {} is empty",
                notification.task_id
            )));
        }
        Ok(Generated::Text(result.generated_text))
    }

    /// Fail a story still waiting on `expected`; stale when it has moved on
    async fn fail_story(
        &self,
        story_id: PublishedStoryId,
        expected: Option<GenerationStep>,
        details: impl AsRef<str>,
    ) -> Result<Handled, ProcessingError> {
        match self
            .errors
            .handle_story_error(story_id, expected, details.as_ref())
            .await?
        {
            Some(_) => Ok(Handled::Failed),
            None => Ok(Handled::Stale),
        }
    }

    /// Publish tasks staged by a committed transaction
    async fn publish(&self, tasks: &[GenerationTask]) {
        let pending = self.dispatcher.publish_staged(&*self.store, tasks).await;
        if pending > 0 {
            warn!(pending, "Follow-up tasks left for the relay");
        }
    }

    /// Queue the client update for a story, plus the push when it just became ready
    fn announce_story(&self, story: &PublishedStory, became_ready: bool) {
        self.outbox.client_update(ClientUpdate::story(story));
        if became_ready && story.status() == StoryStatus::Ready {
            info!(published_story_id = %story.id, "Story ready");
            self.outbox.push(PushNotification::story_ready(story));
        }
    }
}

/// Map a step-manager outcome: stale means skip, anything else propagates
fn settle<T>(result: Result<T, StepError>) -> Result<Option<T>, ProcessingError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StepError::Stale { story_id, reason }) => {
            info!(published_story_id = %story_id, %reason, "Stale notification, skipping");
            Ok(None)
        }
        Err(e @ StepError::InvalidTransition { .. }) => Err(ProcessingError::Invariant(e.to_string())),
        Err(StepError::Repo(e)) => Err(e.into()),
    }
}

/// Apply a transition and stage the follow-up tasks the advanced story calls for
async fn advance<F>(
    tx: &dyn StoreTransaction,
    story_id: PublishedStoryId,
    transition: StepTransition,
    follow_up: F,
) -> Result<(PublishedStory, Vec<GenerationTask>), StepError>
where
    F: FnOnce(&PublishedStory) -> Vec<GenerationTask> + Send,
{
    let story = atomic_transition(tx, story_id, transition).await?;
    let tasks = follow_up(&story);
    tx.stage_tasks(&tasks).await?;
    Ok((story, tasks))
}

/// Context handed to follow-up generation tasks
fn story_context(story: &PublishedStory) -> serde_json::Value {
    serde_json::json!({
        "title": story.title,
        "config": story.config,
        "setup": story.setup,
        "is_adult_content": story.is_adult_content,
    })
}

fn story_brief(story: &PublishedStory) -> String {
    story_context(story).to_string()
}
