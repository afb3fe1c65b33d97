//! Scene planner: creates the initial scene and fans out characters and cards

use tracing::{info, instrument, warn};

use super::{advance, settle, story_brief, story_context, Generated, StageHandlers};
use crate::application::dto::ScenePlan;
use crate::application::ports::outbound::{finish_transaction, StoreTransaction};
use crate::application::services::notification_processor::{Handled, ProcessingError};
use crate::application::services::step_manager::{determine_next_step, StepError};
use crate::domain::entities::{
    GenerationTask, ImageRequest, Notification, PublishedStory, StepTransition, StoryScene,
    PORTRAIT_RATIO,
};
use crate::domain::value_objects::{
    GenerationStep, ImageKey, PendingCounters, PublishedStoryId, TaskType, INITIAL_STATE_HASH,
};

impl StageHandlers {
    #[instrument(skip(self, notification), fields(published_story_id = %story_id))]
    pub(crate) async fn handle_scene_planner(
        &self,
        notification: &Notification,
        story_id: PublishedStoryId,
    ) -> Result<Handled, ProcessingError> {
        let Some(_story) = self
            .load_story_at(story_id, GenerationStep::ScenePlanner)
            .await?
        else {
            return Ok(Handled::Stale);
        };
        let text = match self.generated_text(notification).await? {
            Generated::Text(text) => text,
            Generated::Failed(details) => {
                return self
                    .fail_story(story_id, Some(GenerationStep::ScenePlanner), details)
                    .await
            }
        };
        let plan = match ScenePlan::parse(&text) {
            Ok(plan) => plan,
            Err(e) => {
                let details = format!("scene planner: {e}");
                return self
                    .fail_story(story_id, Some(GenerationStep::ScenePlanner), details)
                    .await;
            }
        };

        let cards = card_requests(&plan);
        let counters = PendingCounters {
            character_gen: u32::from(plan.wants_characters()),
            card_image: cards.len() as u32,
            character_image: 0,
        };

        let tx = self.store.begin().await?;
        let outcome = apply_plan(&*tx, story_id, &plan, cards, counters).await;
        let Some((story, tasks)) = settle(finish_transaction(tx, outcome).await)? else {
            return Ok(Handled::Stale);
        };
        info!(
            next_step = %story.step(),
            character_gen = counters.character_gen,
            card_images = counters.card_image,
            "Scene plan stored"
        );

        self.publish(&tasks).await;
        self.announce_story(&story, false);
        Ok(Handled::Applied)
    }
}

fn card_requests(plan: &ScenePlan) -> Vec<ImageRequest> {
    let mut requests: Vec<ImageRequest> = Vec::new();
    for card in &plan.new_card_suggestions {
        let Some(key) = ImageKey::card(&card.image_reference_name) else {
            warn!(name = %card.image_reference_name, "Skipping card with unusable image reference");
            continue;
        };
        if requests.iter().any(|r| r.key == key) {
            continue;
        }
        requests.push(ImageRequest {
            key,
            prompt: card.image_prompt_descriptor.trim().to_string(),
            negative_prompt: String::new(),
            ratio: PORTRAIT_RATIO.to_string(),
        });
    }
    requests
}

async fn apply_plan(
    tx: &dyn StoreTransaction,
    story_id: PublishedStoryId,
    plan: &ScenePlan,
    cards: Vec<ImageRequest>,
    counters: PendingCounters,
) -> Result<(PublishedStory, Vec<GenerationTask>), StepError> {
    if tx.find_scene(story_id, INITIAL_STATE_HASH).await?.is_none() {
        let mut scene = StoryScene::initial(story_id);
        scene.plan = Some(plan.document.clone());
        tx.upsert_scene(&scene).await?;
    }

    let transition = StepTransition::new(GenerationStep::ScenePlanner, determine_next_step(&counters))
        .with_counters(counters);
    advance(tx, story_id, transition, |story| {
        planned_tasks(story, plan, cards, counters)
    })
    .await
}

/// Character generation, card images, and setup when there is nothing to fan out
fn planned_tasks(
    story: &PublishedStory,
    plan: &ScenePlan,
    cards: Vec<ImageRequest>,
    counters: PendingCounters,
) -> Vec<GenerationTask> {
    let mut tasks = Vec::new();
    if counters.character_gen > 0 {
        let input = serde_json::json!({
            "story": story_context(story),
            "scene_focus": plan.scene_focus,
            "new_character_suggestions": plan
                .new_character_suggestions
                .iter()
                .map(|c| serde_json::json!({"role": c.role, "reason": c.reason}))
                .collect::<Vec<_>>(),
        });
        tasks.push(GenerationTask::for_story(
            TaskType::CharacterGeneration,
            story,
            input.to_string(),
        ));
    }
    tasks.extend(
        cards
            .into_iter()
            .map(|request| GenerationTask::image(TaskType::CharacterImage, story, request)),
    );
    if story.step() == GenerationStep::SetupGeneration {
        tasks.push(GenerationTask::for_story(TaskType::Setup, story, story_brief(story)));
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use crate::application::ports::outbound::StorySceneRepository;
    use crate::application::services::notification_processor::Handled;
    use crate::domain::value_objects::{
        GenerationStep, PendingCounters, StoryStatus, TaskType, INITIAL_STATE_HASH,
    };

    const PLAN: &str = r#"{
        "scene_focus": "a storm over the harbor",
        "new_card_suggestions": [
            {"image_reference_name": "Lighthouse", "image_prompt_descriptor": "a lighthouse in a storm", "title": "Light", "reason": "landmark"},
            {"image_reference_name": "Old Pier", "image_prompt_descriptor": "a rotting pier", "title": "Pier", "reason": "meeting point"}
        ],
        "new_character_suggestions": [{"role": "keeper", "reason": "knows the secret"}]
    }"#;

    #[tokio::test]
    async fn test_plan_fans_out_characters_and_cards() {
        let h = Harness::new();
        let story = h.story_at(GenerationStep::ScenePlanner, PendingCounters::default()).await;
        let n = h.success(TaskType::ScenePlanner, story.id, PLAN).await;

        assert_eq!(
            h.handlers.handle_scene_planner(&n, story.id).await.unwrap(),
            Handled::Applied
        );

        let story = h.story(story.id).await;
        assert_eq!(story.step(), GenerationStep::CharacterGeneration);
        assert_eq!(story.status(), StoryStatus::SubTasksPending);
        assert_eq!(
            story.counters(),
            PendingCounters {
                character_gen: 1,
                card_image: 2,
                character_image: 0
            }
        );

        let tasks = h.publisher.tasks.lock().unwrap().clone();
        assert_eq!(tasks.len(), 3);
        let card_keys: Vec<_> = tasks
            .iter()
            .filter_map(|t| t.image.as_ref().map(|i| i.key.as_str().to_string()))
            .collect();
        assert_eq!(card_keys, vec!["card_lighthouse", "card_old_pier"]);

        let scene = h
            .store
            .find_scene(story.id, INITIAL_STATE_HASH)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scene.plan.unwrap()["scene_focus"], "a storm over the harbor");
    }

    #[tokio::test]
    async fn test_plan_without_fan_out_goes_straight_to_setup() {
        let h = Harness::new();
        let story = h.story_at(GenerationStep::ScenePlanner, PendingCounters::default()).await;
        let n = h
            .success(TaskType::ScenePlanner, story.id, r#"{"scene_focus": "quiet"}"#)
            .await;

        h.handlers.handle_scene_planner(&n, story.id).await.unwrap();
        assert_eq!(h.story(story.id).await.step(), GenerationStep::SetupGeneration);
        assert_eq!(h.publisher.types(), vec![TaskType::Setup]);
    }

    #[tokio::test]
    async fn test_unparseable_plan_fails_story() {
        let h = Harness::new();
        let story = h.story_at(GenerationStep::ScenePlanner, PendingCounters::default()).await;
        let n = h.success(TaskType::ScenePlanner, story.id, "I cannot help with that").await;

        assert_eq!(
            h.handlers.handle_scene_planner(&n, story.id).await.unwrap(),
            Handled::Failed
        );
        let story = h.story(story.id).await;
        assert_eq!(story.status(), StoryStatus::Error);
        assert!(story.error_details.unwrap().starts_with("scene planner"));
    }
}
