//! Moderation and protagonist goal: the linear stages before planning

use tracing::instrument;

use super::{advance, settle, story_brief, Generated, StageHandlers};
use crate::application::dto::{generated::merge_objects, ModerationOutcome, ProtagonistGoal};
use crate::application::ports::outbound::finish_transaction;
use crate::application::services::notification_processor::{Handled, ProcessingError};
use crate::domain::entities::{GenerationTask, Notification, StepTransition};
use crate::domain::value_objects::{GenerationStep, PublishedStoryId, TaskType};

impl StageHandlers {
    #[instrument(skip(self, notification), fields(published_story_id = %story_id))]
    pub(crate) async fn handle_moderation(
        &self,
        notification: &Notification,
        story_id: PublishedStoryId,
    ) -> Result<Handled, ProcessingError> {
        let Some(_story) = self.load_story_at(story_id, GenerationStep::Moderation).await? else {
            return Ok(Handled::Stale);
        };
        let text = match self.generated_text(notification).await? {
            Generated::Text(text) => text,
            Generated::Failed(details) => {
                return self.fail_story(story_id, Some(GenerationStep::Moderation), details).await
            }
        };
        let outcome = match ModerationOutcome::parse(&text) {
            Ok(outcome) => outcome,
            Err(e) => {
                let details = format!("content moderation: {e}");
                return self.fail_story(story_id, Some(GenerationStep::Moderation), details).await;
            }
        };

        let transition = StepTransition::new(GenerationStep::Moderation, GenerationStep::ProtagonistGoal)
            .with_adult_content(outcome.is_adult_content);
        let tx = self.store.begin().await?;
        let outcome = advance(&*tx, story_id, transition, |story| {
            vec![GenerationTask::for_story(TaskType::ProtagonistGoal, story, story_brief(story))]
        })
        .await;
        let Some((story, tasks)) = settle(finish_transaction(tx, outcome).await)? else {
            return Ok(Handled::Stale);
        };

        self.publish(&tasks).await;
        self.announce_story(&story, false);
        Ok(Handled::Applied)
    }

    #[instrument(skip(self, notification), fields(published_story_id = %story_id))]
    pub(crate) async fn handle_protagonist_goal(
        &self,
        notification: &Notification,
        story_id: PublishedStoryId,
    ) -> Result<Handled, ProcessingError> {
        let Some(story) = self
            .load_story_at(story_id, GenerationStep::ProtagonistGoal)
            .await?
        else {
            return Ok(Handled::Stale);
        };
        let text = match self.generated_text(notification).await? {
            Generated::Text(text) => text,
            Generated::Failed(details) => {
                return self
                    .fail_story(story_id, Some(GenerationStep::ProtagonistGoal), details)
                    .await
            }
        };
        let goal = match ProtagonistGoal::parse(&text) {
            Ok(goal) => goal,
            Err(e) => {
                let details = format!("protagonist goal: {e}");
                return self
                    .fail_story(story_id, Some(GenerationStep::ProtagonistGoal), details)
                    .await;
            }
        };

        let setup = merge_objects(
            &story.setup,
            &serde_json::json!({ "protagonist_goal": goal.goal }),
        );
        let transition = StepTransition::new(GenerationStep::ProtagonistGoal, GenerationStep::ScenePlanner)
            .with_setup(setup);
        let tx = self.store.begin().await?;
        let outcome = advance(&*tx, story_id, transition, |story| {
            vec![GenerationTask::for_story(TaskType::ScenePlanner, story, story_brief(story))]
        })
        .await;
        let Some((story, tasks)) = settle(finish_transaction(tx, outcome).await)? else {
            return Ok(Handled::Stale);
        };

        self.publish(&tasks).await;
        self.announce_story(&story, false);
        Ok(Handled::Applied)
    }
}
