//! Character generation: stores the cast and fans out their portraits

use tracing::{instrument, warn};

use super::{advance, settle, story_brief, Generated, StageHandlers};
use crate::application::dto::GeneratedCharacter;
use crate::application::ports::outbound::{finish_transaction, RepoError, StoreTransaction};
use crate::application::services::notification_processor::{Handled, ProcessingError};
use crate::application::services::step_manager::StepError;
use crate::domain::entities::{
    GenerationTask, ImageRequest, Notification, PublishedStory, StepTransition, StoryScene,
    PORTRAIT_RATIO,
};
use crate::domain::value_objects::{
    CounterDeltas, GenerationStep, ImageKey, PendingCounters, PublishedStoryId, TaskType,
    INITIAL_STATE_HASH,
};

const STAGE: Option<GenerationStep> = Some(GenerationStep::CharacterGeneration);

impl StageHandlers {
    #[instrument(skip(self, notification), fields(published_story_id = %story_id))]
    pub(crate) async fn handle_character_generation(
        &self,
        notification: &Notification,
        story_id: PublishedStoryId,
    ) -> Result<Handled, ProcessingError> {
        let Some(story) = self
            .load_story_at(story_id, GenerationStep::CharacterGeneration)
            .await?
        else {
            return Ok(Handled::Stale);
        };
        if story.counters().character_gen == 0 {
            return self
                .fail_story(story_id, STAGE, "character generation completed but none was pending")
                .await;
        }
        let text = match self.generated_text(notification).await? {
            Generated::Text(text) => text,
            Generated::Failed(details) => return self.fail_story(story_id, STAGE, details).await,
        };
        let characters = match GeneratedCharacter::parse_all(&text) {
            Ok(characters) => characters,
            Err(e) => {
                return self
                    .fail_story(story_id, STAGE, format!("character generation: {e}"))
                    .await
            }
        };

        let portraits = portrait_requests(&characters);
        let tx = self.store.begin().await?;
        let outcome = apply_characters(&*tx, story_id, &characters, portraits).await;
        let Some((story, tasks)) = settle(finish_transaction(tx, outcome).await)? else {
            return Ok(Handled::Stale);
        };

        self.publish(&tasks).await;
        self.announce_story(&story, false);
        Ok(Handled::Applied)
    }
}

fn portrait_requests(characters: &[GeneratedCharacter]) -> Vec<ImageRequest> {
    let mut requests: Vec<ImageRequest> = Vec::new();
    for character in characters {
        let Some(key) = ImageKey::character(&character.ir) else {
            warn!(name = %character.n, image_ref = %character.ir, "Skipping portrait with unusable image reference");
            continue;
        };
        if requests.iter().any(|r| r.key == key) {
            continue;
        }
        requests.push(ImageRequest {
            key,
            prompt: character.pr.trim().to_string(),
            negative_prompt: String::new(),
            ratio: PORTRAIT_RATIO.to_string(),
        });
    }
    requests
}

/// Store the cast and settle character generation against the counters held
/// at write time, so image completions landing meanwhile are kept.
async fn apply_characters(
    tx: &dyn StoreTransaction,
    story_id: PublishedStoryId,
    characters: &[GeneratedCharacter],
    portraits: Vec<ImageRequest>,
) -> Result<(PublishedStory, Vec<GenerationTask>), StepError> {
    let mut scene = tx
        .find_scene(story_id, INITIAL_STATE_HASH)
        .await?
        .unwrap_or_else(|| StoryScene::initial(story_id));
    for character in characters {
        let value =
            serde_json::to_value(character).map_err(|e| RepoError::Serialization(e.to_string()))?;
        scene.characters.push(value);
    }
    scene.touch();
    tx.upsert_scene(&scene).await?;

    let transition = StepTransition::settle_fan_out(
        GenerationStep::CharacterGeneration,
        CounterDeltas::character_gen(1),
        PendingCounters {
            character_image: portraits.len() as u32,
            ..PendingCounters::default()
        },
    );
    advance(tx, story_id, transition, |story| {
        let mut tasks: Vec<GenerationTask> = portraits
            .into_iter()
            .map(|request| GenerationTask::image(TaskType::CharacterImage, story, request))
            .collect();
        if story.step() == GenerationStep::SetupGeneration {
            tasks.push(GenerationTask::for_story(TaskType::Setup, story, story_brief(story)));
        }
        tasks
    })
    .await
}
