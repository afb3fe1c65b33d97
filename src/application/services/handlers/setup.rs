//! Setup: fans out the remaining images and decides whether a first scene is needed

use tracing::{debug, info, instrument};

use super::{advance, settle, story_brief, Generated, StageHandlers};
use crate::application::dto::{generated::merge_objects, SetupContent};
use crate::application::ports::outbound::{finish_transaction, RepoError, StoreTransaction};
use crate::application::services::notification_processor::{Handled, ProcessingError};
use crate::application::services::step_manager::StepError;
use crate::domain::entities::{
    GenerationTask, ImageRequest, Notification, PublishedStory, StepTransition, PORTRAIT_RATIO,
    PREVIEW_RATIO,
};
use crate::domain::value_objects::{
    GenerationStep, ImageKey, PendingCounters, PublishedStoryId, TaskType, INITIAL_STATE_HASH,
};

impl StageHandlers {
    #[instrument(skip(self, notification), fields(published_story_id = %story_id))]
    pub(crate) async fn handle_setup(
        &self,
        notification: &Notification,
        story_id: PublishedStoryId,
    ) -> Result<Handled, ProcessingError> {
        let Some(story) = self
            .load_story_at(story_id, GenerationStep::SetupGeneration)
            .await?
        else {
            return Ok(Handled::Stale);
        };
        let text = match self.generated_text(notification).await? {
            Generated::Text(text) => text,
            Generated::Failed(details) => {
                return self
                    .fail_story(story_id, Some(GenerationStep::SetupGeneration), details)
                    .await
            }
        };
        let content = match SetupContent::parse(&text) {
            Ok(content) => content,
            Err(e) => {
                let details = format!("setup: {e}");
                return self
                    .fail_story(story_id, Some(GenerationStep::SetupGeneration), details)
                    .await;
            }
        };

        let images = self.missing_images(&story, &content).await?;
        let counters = PendingCounters {
            character_image: images.len() as u32,
            ..PendingCounters::default()
        };
        let setup = merge_objects(&story.setup, &content.document);

        let tx = self.store.begin().await?;
        let outcome = apply_setup(&*tx, story_id, setup, images, counters).await;
        let Some((story, tasks)) = settle(finish_transaction(tx, outcome).await)? else {
            return Ok(Handled::Stale);
        };
        info!(
            next_step = %story.step(),
            images = counters.character_image,
            "Setup stored"
        );

        self.publish(&tasks).await;
        self.announce_story(&story, true);
        Ok(Handled::Applied)
    }

    /// Portraits and the preview image that have no stored image yet
    async fn missing_images(
        &self,
        story: &PublishedStory,
        content: &SetupContent,
    ) -> Result<Vec<(TaskType, ImageRequest)>, RepoError> {
        let mut requests: Vec<(TaskType, ImageRequest)> = Vec::new();

        for character in &content.chars {
            if character.pr.trim().is_empty() {
                continue;
            }
            let Some(key) = ImageKey::character(&character.ir) else {
                continue;
            };
            if requests.iter().any(|(_, r)| r.key == key) {
                continue;
            }
            if self.store.find_image(&key).await?.is_some() {
                debug!(%key, "Portrait already generated");
                continue;
            }
            requests.push((
                TaskType::CharacterImage,
                ImageRequest {
                    key,
                    prompt: character.pr.trim().to_string(),
                    negative_prompt: character.npr.trim().to_string(),
                    ratio: PORTRAIT_RATIO.to_string(),
                },
            ));
        }

        let preview_prompt = content.spi.trim();
        if !preview_prompt.is_empty() {
            let key = ImageKey::story_preview(story.id);
            if self.store.find_image(&key).await?.is_none() {
                requests.push((
                    TaskType::PreviewImage,
                    ImageRequest {
                        key,
                        prompt: preview_prompt.to_string(),
                        negative_prompt: String::new(),
                        ratio: PREVIEW_RATIO.to_string(),
                    },
                ));
            }
        }
        Ok(requests)
    }
}

async fn apply_setup(
    tx: &dyn StoreTransaction,
    story_id: PublishedStoryId,
    setup: serde_json::Value,
    images: Vec<(TaskType, ImageRequest)>,
    counters: PendingCounters,
) -> Result<(PublishedStory, Vec<GenerationTask>), StepError> {
    let has_first_scene = tx
        .find_scene(story_id, INITIAL_STATE_HASH)
        .await?
        .is_some_and(|scene| scene.has_scene_text());
    let next = if has_first_scene {
        GenerationStep::Complete
    } else {
        GenerationStep::FirstScene
    };

    let transition = StepTransition::new(GenerationStep::SetupGeneration, next)
        .with_counters(counters)
        .with_first_scene_pending(next == GenerationStep::FirstScene)
        .with_setup(setup);
    advance(tx, story_id, transition, |story| {
        let mut tasks: Vec<GenerationTask> = images
            .into_iter()
            .map(|(task_type, request)| GenerationTask::image(task_type, story, request))
            .collect();
        if story.step() == GenerationStep::FirstScene {
            tasks.push(
                GenerationTask::for_story(TaskType::SceneContinuation, story, story_brief(story))
                    .at_state(INITIAL_STATE_HASH),
            );
        }
        tasks
    })
    .await
}
