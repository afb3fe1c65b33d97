//! Scene text and its structured JSON, for the first scene and for live sessions

use tracing::{info, instrument, warn};

use super::{settle, Generated, StageHandlers};
use crate::application::dto::generated::{decode, ending_text, parse_scene};
use crate::application::dto::{ClientUpdate, PushNotification};
use crate::application::ports::outbound::{finish_transaction, RepoError, StoreTransaction};
use crate::application::services::notification_processor::{Handled, ProcessingError};
use crate::application::services::notification_router::{determine_error_scope, ErrorScope};
use crate::application::services::step_manager::{
    atomic_transition, atomic_update_step_and_status, StepError,
};
use crate::domain::entities::{
    GenerationTask, Notification, PlayerGameState, PlayerStatus, PublishedStory, StepTransition,
    StoryScene,
};
use crate::domain::value_objects::{
    GameStateId, GenerationStep, PublishedStoryId, StoryStatus, TaskType, INITIAL_STATE_HASH,
};

impl StageHandlers {
    /// First scene of a story, generated before anyone plays it
    #[instrument(skip(self, notification), fields(published_story_id = %story_id))]
    pub(crate) async fn handle_initial_scene(
        &self,
        notification: &Notification,
        story_id: PublishedStoryId,
    ) -> Result<Handled, ProcessingError> {
        let Some(_story) = self.load_story_at(story_id, GenerationStep::FirstScene).await? else {
            return Ok(Handled::Stale);
        };
        let text = match self.generated_text(notification).await? {
            Generated::Text(text) => text,
            Generated::Failed(details) => {
                return self
                    .fail_story(story_id, Some(GenerationStep::FirstScene), details)
                    .await
            }
        };
        let document = match parse_scene(&text, false) {
            Ok(document) => document,
            Err(e) => {
                let details = format!("first scene: {e}");
                return self
                    .fail_story(story_id, Some(GenerationStep::FirstScene), details)
                    .await;
            }
        };

        let tx = self.store.begin().await?;
        let outcome = store_initial_scene(&*tx, story_id, &document).await;
        let Some((story, tasks)) = settle(finish_transaction(tx, outcome).await)? else {
            return Ok(Handled::Stale);
        };

        self.publish(&tasks).await;
        self.announce_story(&story, false);
        Ok(Handled::Applied)
    }

    /// Structured form of the first scene; completes the story pipeline
    #[instrument(skip(self, notification), fields(published_story_id = %story_id))]
    pub(crate) async fn handle_json_generation(
        &self,
        notification: &Notification,
        story_id: PublishedStoryId,
    ) -> Result<Handled, ProcessingError> {
        let Some(_story) = self
            .load_story_at(story_id, GenerationStep::InitialSceneJson)
            .await?
        else {
            return Ok(Handled::Stale);
        };
        let text = match self.generated_text(notification).await? {
            Generated::Text(text) => text,
            Generated::Failed(details) => {
                return self
                    .fail_story(story_id, Some(GenerationStep::InitialSceneJson), details)
                    .await
            }
        };
        let structured: serde_json::Value = match decode(&text) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            Ok(_) => {
                let details = "json generation: not an object";
                return self
                    .fail_story(story_id, Some(GenerationStep::InitialSceneJson), details)
                    .await;
            }
            Err(e) => {
                let details = format!("json generation: {e}");
                return self
                    .fail_story(story_id, Some(GenerationStep::InitialSceneJson), details)
                    .await;
            }
        };

        let tx = self.store.begin().await?;
        let outcome = complete_story(&*tx, story_id, structured).await;
        let Some((story, sessions)) = settle(finish_transaction(tx, outcome).await)? else {
            return Ok(Handled::Stale);
        };

        for state in &sessions {
            self.outbox.client_update(ClientUpdate::game_state(state));
        }
        if !sessions.is_empty() {
            info!(sessions = sessions.len(), "Waiting sessions entered the first scene");
        }
        self.announce_story(&story, true);
        Ok(Handled::Applied)
    }

    /// A scene generated for a live session, including game over scenes
    #[instrument(skip(self, notification, state_hash), fields(published_story_id = %story_id, game_state_id = %game_state_id))]
    pub(crate) async fn handle_session_scene(
        &self,
        notification: &Notification,
        story_id: PublishedStoryId,
        game_state_id: GameStateId,
        state_hash: &str,
        game_over: bool,
    ) -> Result<Handled, ProcessingError> {
        let state = self.store.get_game_state(game_state_id).await?;
        if state.story_id != story_id {
            warn!(actual_story_id = %state.story_id, "Session belongs to another story");
            return Ok(Handled::Invalid);
        }
        if state.status != PlayerStatus::GeneratingScene {
            info!(status = state.status.as_str(), "Session is not waiting for a scene");
            return Ok(Handled::Stale);
        }

        let text = match self.generated_text(notification).await? {
            Generated::Text(text) => text,
            Generated::Failed(details) => {
                return self.fail_scene(story_id, game_state_id, state_hash, &details).await
            }
        };
        let document = match parse_scene(&text, game_over) {
            Ok(document) => document,
            Err(e) => {
                let details = format!("scene continuation: {e}");
                return self.fail_scene(story_id, game_state_id, state_hash, &details).await;
            }
        };

        let tx = self.store.begin().await?;
        let outcome = store_session_scene(&*tx, game_state_id, story_id, state_hash, &document, game_over).await;
        let Some(state) = finish_transaction(tx, outcome).await? else {
            info!("Session settled while the scene was being stored");
            return Ok(Handled::Stale);
        };
        let story = self.store.get_story(story_id).await?;

        self.outbox.client_update(ClientUpdate::game_state(&state));
        self.outbox.push(PushNotification::scene_ready(&state, &story));
        Ok(Handled::Applied)
    }

    async fn fail_scene(
        &self,
        story_id: PublishedStoryId,
        game_state_id: GameStateId,
        state_hash: &str,
        details: &str,
    ) -> Result<Handled, ProcessingError> {
        match determine_error_scope(Some(state_hash), Some(game_state_id)) {
            ErrorScope::Story => self.fail_story(story_id, None, details).await,
            ErrorScope::Session(id) => match self.errors.handle_game_state_error(id, details).await? {
                Some(_) => Ok(Handled::Failed),
                None => Ok(Handled::Stale),
            },
        }
    }
}

async fn store_initial_scene(
    tx: &dyn StoreTransaction,
    story_id: PublishedStoryId,
    document: &serde_json::Value,
) -> Result<(PublishedStory, Vec<GenerationTask>), StepError> {
    let mut scene = tx
        .find_scene(story_id, INITIAL_STATE_HASH)
        .await?
        .unwrap_or_else(|| StoryScene::initial(story_id));
    scene.scene = Some(document.clone());
    scene.touch();
    tx.upsert_scene(&scene).await?;

    let story = atomic_update_step_and_status(
        tx,
        story_id,
        GenerationStep::FirstScene,
        GenerationStep::InitialSceneJson,
        StoryStatus::JsonGenerationPending,
    )
    .await?;
    let json = GenerationTask::for_story(TaskType::JsonGeneration, &story, document.to_string())
        .at_state(INITIAL_STATE_HASH);
    tx.stage_tasks(std::slice::from_ref(&json)).await?;
    Ok((story, vec![json]))
}

async fn complete_story(
    tx: &dyn StoreTransaction,
    story_id: PublishedStoryId,
    structured: serde_json::Value,
) -> Result<(PublishedStory, Vec<PlayerGameState>), StepError> {
    let mut scene = tx
        .find_scene(story_id, INITIAL_STATE_HASH)
        .await?
        .unwrap_or_else(|| StoryScene::initial(story_id));
    scene.structured = Some(structured);
    scene.touch();
    let scene = tx.upsert_scene(&scene).await?;

    let transition = StepTransition::new(GenerationStep::InitialSceneJson, GenerationStep::Complete)
        .with_first_scene_pending(false);
    let story = atomic_transition(tx, story_id, transition).await?;

    let mut entered = Vec::new();
    for mut state in tx.list_game_states(story_id).await? {
        if state.status == PlayerStatus::GeneratingScene {
            state.enter_scene(scene.id);
            tx.save_game_state(&state).await?;
            entered.push(state);
        }
    }
    Ok((story, entered))
}

/// Store the scene and advance the session. `None` when the session no longer waits.
async fn store_session_scene(
    tx: &dyn StoreTransaction,
    game_state_id: GameStateId,
    story_id: PublishedStoryId,
    state_hash: &str,
    document: &serde_json::Value,
    game_over: bool,
) -> Result<Option<PlayerGameState>, RepoError> {
    let mut state = tx.get_game_state(game_state_id).await?;
    if state.status != PlayerStatus::GeneratingScene {
        return Ok(None);
    }

    let mut scene = tx
        .find_scene(story_id, state_hash)
        .await?
        .unwrap_or_else(|| StoryScene::new(story_id, state_hash));
    scene.scene = Some(document.clone());
    scene.touch();
    let scene = tx.upsert_scene(&scene).await?;

    if game_over || !has_choices(document) {
        state.complete(scene.id, ending_text(document));
    } else {
        state.enter_scene(scene.id);
    }
    tx.save_game_state(&state).await?;
    Ok(Some(state))
}

fn has_choices(document: &serde_json::Value) -> bool {
    document
        .get("ch")
        .and_then(serde_json::Value::as_array)
        .is_some_and(|choices| !choices.is_empty())
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use crate::application::ports::outbound::{PlayerGameStateRepository, StorySceneRepository};
    use crate::application::services::notification_processor::Handled;
    use crate::domain::entities::{
        PlayerGameState, PlayerProgress, PlayerStatus, PublishedStory, StoryScene,
    };
    use crate::domain::value_objects::{
        GenerationStep, PendingCounters, StoryStatus, TaskType, INITIAL_STATE_HASH,
    };

    const SCENE: &str = r#"{"tx": "The bell rings.", "ch": [{"t": "Run"}, {"t": "Hide"}]}"#;

    async fn session(h: &Harness, story: &PublishedStory, hash: &str, index: u32) -> PlayerGameState {
        let progress = PlayerProgress::new(story.user_id, story.id, hash, index);
        let state = PlayerGameState::new(story.user_id, story.id, progress.id);
        h.store.insert_progress(progress).await;
        h.store.insert_game_state(state.clone()).await;
        state
    }

    #[tokio::test]
    async fn test_first_scene_is_stored_and_json_requested() {
        let h = Harness::new();
        let story = h.story_at(GenerationStep::FirstScene, PendingCounters::default()).await;
        let n = h.success(TaskType::SceneContinuation, story.id, SCENE).await;

        assert_eq!(
            h.handlers.handle_initial_scene(&n, story.id).await.unwrap(),
            Handled::Applied
        );

        let story = h.story(story.id).await;
        assert_eq!(story.step(), GenerationStep::InitialSceneJson);
        assert_eq!(story.status(), StoryStatus::JsonGenerationPending);
        let scene = h
            .store
            .find_scene(story.id, INITIAL_STATE_HASH)
            .await
            .unwrap()
            .unwrap();
        assert!(scene.has_scene_text());

        let tasks = h.publisher.tasks.lock().unwrap().clone();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, TaskType::JsonGeneration);
        assert_eq!(tasks[0].state_hash.as_deref(), Some(INITIAL_STATE_HASH));
    }

    #[tokio::test]
    async fn test_first_scene_without_choices_fails_story() {
        let h = Harness::new();
        let story = h.story_at(GenerationStep::FirstScene, PendingCounters::default()).await;
        let n = h
            .success(TaskType::SceneContinuation, story.id, r#"{"tx": "nothing to do"}"#)
            .await;

        assert_eq!(
            h.handlers.handle_initial_scene(&n, story.id).await.unwrap(),
            Handled::Failed
        );
        assert_eq!(h.story(story.id).await.status(), StoryStatus::Error);
    }

    #[tokio::test]
    async fn test_json_completes_story_and_releases_waiting_sessions() {
        let mut h = Harness::new();
        let story = h
            .story_at(GenerationStep::InitialSceneJson, PendingCounters::default())
            .await;
        h.store.insert_scene(StoryScene::initial(story.id)).await;
        let waiting = session(&h, &story, INITIAL_STATE_HASH, 0).await;
        let n = h
            .success(TaskType::JsonGeneration, story.id, r#"{"scene": {"id": 1}}"#)
            .await;

        assert_eq!(
            h.handlers.handle_json_generation(&n, story.id).await.unwrap(),
            Handled::Applied
        );

        let story = h.story(story.id).await;
        assert_eq!(story.status(), StoryStatus::Ready);
        assert!(!story.is_first_scene_pending());

        let state = h.store.get_game_state(waiting.id).await.unwrap();
        assert_eq!(state.status, PlayerStatus::Playing);
        assert!(state.current_scene_id.is_some());

        let messages = h.messages();
        assert_eq!(client_statuses(&messages), vec!["playing", "ready"]);
        assert_eq!(pushes(&messages).len(), 1);
    }

    #[tokio::test]
    async fn test_json_with_images_outstanding_waits_for_them() {
        let mut h = Harness::new();
        let story = h
            .story_at(
                GenerationStep::InitialSceneJson,
                PendingCounters {
                    character_image: 1,
                    ..PendingCounters::default()
                },
            )
            .await;
        let n = h.success(TaskType::JsonGeneration, story.id, r#"{"a": 1}"#).await;

        h.handlers.handle_json_generation(&n, story.id).await.unwrap();

        let story = h.story(story.id).await;
        assert_eq!(story.step(), GenerationStep::Complete);
        assert_eq!(story.status(), StoryStatus::ImageGenerationPending);
        assert!(pushes(&h.messages()).is_empty());
    }

    #[tokio::test]
    async fn test_session_scene_enters_scene_and_notifies() {
        let mut h = Harness::new();
        let story = h.story_at(GenerationStep::Complete, PendingCounters::default()).await;
        let state = session(&h, &story, "hash-1", 1).await;
        let n = h.success(TaskType::SceneContinuation, story.id, SCENE).await;

        assert_eq!(
            h.handlers
                .handle_session_scene(&n, story.id, state.id, "hash-1", false)
                .await
                .unwrap(),
            Handled::Applied
        );

        let stored = h.store.get_game_state(state.id).await.unwrap();
        assert_eq!(stored.status, PlayerStatus::Playing);
        let scene = h.store.find_scene(story.id, "hash-1").await.unwrap().unwrap();
        assert_eq!(stored.current_scene_id, Some(scene.id));

        let messages = h.messages();
        assert_eq!(client_statuses(&messages), vec!["playing"]);
        assert_eq!(
            pushes(&messages)[0].data.get("eventType").map(String::as_str),
            Some("scene_ready")
        );
    }

    #[tokio::test]
    async fn test_game_over_completes_session_with_ending() {
        let h = Harness::new();
        let story = h.story_at(GenerationStep::Complete, PendingCounters::default()).await;
        let state = session(&h, &story, "hash-9", 9).await;
        let n = h
            .success(TaskType::GameOver, story.id, r#"{"et": "The harbor falls silent.", "ch": []}"#)
            .await;

        h.handlers
            .handle_session_scene(&n, story.id, state.id, "hash-9", true)
            .await
            .unwrap();

        let stored = h.store.get_game_state(state.id).await.unwrap();
        assert_eq!(stored.status, PlayerStatus::Completed);
        assert_eq!(stored.ending_text.as_deref(), Some("The harbor falls silent."));
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_session_scene_rolls_back() {
        let h = Harness::new();
        let story = h.story_at(GenerationStep::Complete, PendingCounters::default()).await;
        h.store.insert_scene(StoryScene::new(story.id, "hash-0")).await;
        h.store
            .insert_progress(PlayerProgress::new(story.user_id, story.id, "hash-0", 0))
            .await;
        let state = session(&h, &story, "hash-1", 1).await;
        let n = h.failure(TaskType::SceneContinuation, story.id, "narrator timeout");

        assert_eq!(
            h.handlers
                .handle_session_scene(&n, story.id, state.id, "hash-1", false)
                .await
                .unwrap(),
            Handled::Failed
        );

        let stored = h.store.get_game_state(state.id).await.unwrap();
        assert_eq!(stored.status, PlayerStatus::Playing);
        assert_ne!(stored.progress_id, state.progress_id);
        assert_eq!(h.story(story.id).await.status(), StoryStatus::Ready);
    }

    #[tokio::test]
    async fn test_scene_for_settled_session_is_stale() {
        let h = Harness::new();
        let story = h.story_at(GenerationStep::Complete, PendingCounters::default()).await;
        let mut state = session(&h, &story, "hash-1", 1).await;
        state.fail("earlier failure");
        h.store.save_game_state(&state).await.unwrap();
        let n = h.success(TaskType::SceneContinuation, story.id, SCENE).await;

        assert_eq!(
            h.handlers
                .handle_session_scene(&n, story.id, state.id, "hash-1", false)
                .await
                .unwrap(),
            Handled::Stale
        );
        assert!(h.store.find_scene(story.id, "hash-1").await.unwrap().is_none());
    }
}
