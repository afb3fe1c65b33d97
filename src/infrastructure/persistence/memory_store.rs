//! In-memory entity store
//!
//! Implements every repository contract over one mutex-guarded state. The
//! atomic operations (`transition_story`, `decrement_story_counters`, ...)
//! run their domain check and write under a single lock acquisition.
//!
//! A transaction takes the store lock for its whole lifetime and works on a
//! copy of the state; commit swaps the copy in, rollback drops it. Code
//! holding a transaction must only use the transaction handle until it is
//! finished, since the store itself is locked meanwhile.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tracing::debug;

use crate::application::ports::outbound::{
    GenerationResultRepository, Guarded, ImageReferenceRepository, PlayerGameStateRepository,
    PlayerProgressRepository, PublishedStoryRepository, RepoError, StagedTaskRepository,
    StoreTransaction, StoryConfigRepository, StorySceneRepository, TransactionPort,
};
use crate::domain::entities::{
    DraftOutcome, FanInReport, GenerationResult, GenerationTask, ImageReference, PlayerGameState,
    PlayerProgress, PublishedStory, StepTransition, StoryConfig, StoryScene,
};
use crate::domain::value_objects::{
    CounterDeltas, GameStateId, GenerationStep, ImageKey, ProgressId, PublishedStoryId,
    StoryConfigId, TaskId, UserId,
};

#[derive(Debug, Clone)]
struct StagedTask {
    task: GenerationTask,
    staged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    configs: HashMap<StoryConfigId, StoryConfig>,
    stories: HashMap<PublishedStoryId, PublishedStory>,
    scenes: HashMap<(PublishedStoryId, String), StoryScene>,
    game_states: HashMap<GameStateId, PlayerGameState>,
    progress: HashMap<ProgressId, PlayerProgress>,
    images: HashMap<ImageKey, ImageReference>,
    results: HashMap<TaskId, GenerationResult>,
    /// In staging order
    staged: Vec<StagedTask>,
}

impl StoreState {
    fn story_mut(&mut self, id: PublishedStoryId) -> Result<&mut PublishedStory, RepoError> {
        self.stories
            .get_mut(&id)
            .ok_or_else(|| RepoError::not_found("PublishedStory", id))
    }

    fn finish_story_config(
        &mut self,
        id: StoryConfigId,
        outcome: DraftOutcome,
    ) -> Result<Option<StoryConfig>, RepoError> {
        let config = self
            .configs
            .get_mut(&id)
            .ok_or_else(|| RepoError::not_found("StoryConfig", id))?;
        Ok(config.finish(outcome).then(|| config.clone()))
    }

    fn transition_story(
        &mut self,
        id: PublishedStoryId,
        transition: &StepTransition,
    ) -> Result<Guarded<PublishedStory>, RepoError> {
        let story = self.story_mut(id)?;
        Ok(match story.apply_transition(transition) {
            Ok(()) => Guarded::Applied(story.clone()),
            Err(reason) => Guarded::Rejected(reason),
        })
    }

    fn decrement_story_counters(
        &mut self,
        id: PublishedStoryId,
        deltas: &CounterDeltas,
    ) -> Result<Guarded<(PublishedStory, FanInReport)>, RepoError> {
        let story = self.story_mut(id)?;
        Ok(match story.apply_decrement(deltas) {
            Ok(report) => Guarded::Applied((story.clone(), report)),
            Err(reason) => Guarded::Rejected(reason),
        })
    }

    fn mark_story_failed(
        &mut self,
        id: PublishedStoryId,
        expected: Option<GenerationStep>,
        details: &str,
    ) -> Result<Guarded<PublishedStory>, RepoError> {
        let story = self.story_mut(id)?;
        Ok(match story.fail_at(expected, details) {
            Ok(()) => Guarded::Applied(story.clone()),
            Err(reason) => Guarded::Rejected(reason),
        })
    }

    fn upsert_scene(&mut self, scene: &StoryScene) -> StoryScene {
        let key = (scene.story_id, scene.state_hash.clone());
        let mut stored = scene.clone();
        if let Some(existing) = self.scenes.get(&key) {
            stored.id = existing.id;
            stored.created_at = existing.created_at;
        }
        self.scenes.insert(key, stored.clone());
        stored
    }

    fn list_scenes(&self, story_id: PublishedStoryId) -> Vec<StoryScene> {
        let mut scenes: Vec<StoryScene> = self
            .scenes
            .values()
            .filter(|s| s.story_id == story_id)
            .cloned()
            .collect();
        scenes.sort_by_key(|s| s.created_at);
        scenes
    }

    fn find_progress(
        &self,
        user_id: UserId,
        story_id: PublishedStoryId,
        state_hash: &str,
    ) -> Option<PlayerProgress> {
        self.progress
            .values()
            .find(|p| p.user_id == user_id && p.story_id == story_id && p.state_hash == state_hash)
            .cloned()
    }
}

/// Gives the repository impls below access to the state they operate on
#[async_trait]
trait StateAccess: Send + Sync {
    async fn state(&self) -> MutexGuard<'_, StoreState>;
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl InMemoryStore {
    pub async fn insert_story_config(&self, config: StoryConfig) {
        self.state.lock().await.configs.insert(config.id, config);
    }

    pub async fn insert_story(&self, story: PublishedStory) {
        self.state.lock().await.stories.insert(story.id, story);
    }

    pub async fn insert_scene(&self, scene: StoryScene) {
        self.state.lock().await.upsert_scene(&scene);
    }

    pub async fn insert_game_state(&self, state: PlayerGameState) {
        self.state.lock().await.game_states.insert(state.id, state);
    }

    pub async fn insert_progress(&self, progress: PlayerProgress) {
        self.state.lock().await.progress.insert(progress.id, progress);
    }
}

#[async_trait]
impl StateAccess for InMemoryStore {
    async fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().await
    }
}

/// Open transaction; holds the store lock until committed or rolled back
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<StoreState>,
    working: Mutex<StoreState>,
}

#[async_trait]
impl StateAccess for InMemoryTransaction {
    async fn state(&self) -> MutexGuard<'_, StoreState> {
        self.working.lock().await
    }
}

#[async_trait]
impl TransactionPort for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, RepoError> {
        let guard = self.state.clone().lock_owned().await;
        let working = Mutex::new(guard.clone());
        Ok(Box::new(InMemoryTransaction { guard, working }))
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), RepoError> {
        let Self { mut guard, working } = *self;
        *guard = working.into_inner();
        debug!("Transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        debug!("Transaction rolled back");
    }
}

// =============================================================================
// Repositories shared by the store and its transactions
// =============================================================================

#[async_trait]
impl<T: StateAccess> StoryConfigRepository for T {
    async fn get_story_config(&self, id: StoryConfigId) -> Result<StoryConfig, RepoError> {
        self.state()
            .await
            .configs
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("StoryConfig", id))
    }

    async fn finish_story_config(
        &self,
        id: StoryConfigId,
        outcome: DraftOutcome,
    ) -> Result<Option<StoryConfig>, RepoError> {
        self.state().await.finish_story_config(id, outcome)
    }
}

#[async_trait]
impl<T: StateAccess> PublishedStoryRepository for T {
    async fn get_story(&self, id: PublishedStoryId) -> Result<PublishedStory, RepoError> {
        self.state()
            .await
            .stories
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("PublishedStory", id))
    }

    async fn transition_story(
        &self,
        id: PublishedStoryId,
        transition: &StepTransition,
    ) -> Result<Guarded<PublishedStory>, RepoError> {
        self.state().await.transition_story(id, transition)
    }

    async fn decrement_story_counters(
        &self,
        id: PublishedStoryId,
        deltas: &CounterDeltas,
    ) -> Result<Guarded<(PublishedStory, FanInReport)>, RepoError> {
        self.state().await.decrement_story_counters(id, deltas)
    }

    async fn mark_story_failed(
        &self,
        id: PublishedStoryId,
        expected: Option<GenerationStep>,
        details: &str,
    ) -> Result<Guarded<PublishedStory>, RepoError> {
        self.state().await.mark_story_failed(id, expected, details)
    }
}

#[async_trait]
impl<T: StateAccess> StorySceneRepository for T {
    async fn find_scene(
        &self,
        story_id: PublishedStoryId,
        state_hash: &str,
    ) -> Result<Option<StoryScene>, RepoError> {
        Ok(self
            .state()
            .await
            .scenes
            .get(&(story_id, state_hash.to_string()))
            .cloned())
    }

    async fn list_scenes(&self, story_id: PublishedStoryId) -> Result<Vec<StoryScene>, RepoError> {
        Ok(self.state().await.list_scenes(story_id))
    }

    async fn upsert_scene(&self, scene: &StoryScene) -> Result<StoryScene, RepoError> {
        Ok(self.state().await.upsert_scene(scene))
    }
}

#[async_trait]
impl<T: StateAccess> PlayerGameStateRepository for T {
    async fn get_game_state(&self, id: GameStateId) -> Result<PlayerGameState, RepoError> {
        self.state()
            .await
            .game_states
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("PlayerGameState", id))
    }

    async fn list_game_states(
        &self,
        story_id: PublishedStoryId,
    ) -> Result<Vec<PlayerGameState>, RepoError> {
        Ok(self
            .state()
            .await
            .game_states
            .values()
            .filter(|s| s.story_id == story_id)
            .cloned()
            .collect())
    }

    async fn save_game_state(&self, state: &PlayerGameState) -> Result<(), RepoError> {
        self.state().await.game_states.insert(state.id, state.clone());
        Ok(())
    }
}

#[async_trait]
impl<T: StateAccess> PlayerProgressRepository for T {
    async fn get_progress(&self, id: ProgressId) -> Result<PlayerProgress, RepoError> {
        self.state()
            .await
            .progress
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("PlayerProgress", id))
    }

    async fn find_progress(
        &self,
        user_id: UserId,
        story_id: PublishedStoryId,
        state_hash: &str,
    ) -> Result<Option<PlayerProgress>, RepoError> {
        Ok(self.state().await.find_progress(user_id, story_id, state_hash))
    }
}

#[async_trait]
impl<T: StateAccess> StagedTaskRepository for T {
    async fn stage_tasks(&self, tasks: &[GenerationTask]) -> Result<(), RepoError> {
        let staged_at = Utc::now();
        self.state()
            .await
            .staged
            .extend(tasks.iter().cloned().map(|task| StagedTask { task, staged_at }));
        Ok(())
    }

    async fn list_staged_tasks(
        &self,
        staged_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationTask>, RepoError> {
        Ok(self
            .state()
            .await
            .staged
            .iter()
            .filter(|s| s.staged_at <= staged_before)
            .take(limit)
            .map(|s| s.task.clone())
            .collect())
    }

    async fn remove_staged_task(&self, task_id: &TaskId) -> Result<(), RepoError> {
        self.state().await.staged.retain(|s| &s.task.task_id != task_id);
        Ok(())
    }
}

// Images and worker output live outside transactions

#[async_trait]
impl ImageReferenceRepository for InMemoryStore {
    async fn find_image(&self, key: &ImageKey) -> Result<Option<ImageReference>, RepoError> {
        Ok(self.state.lock().await.images.get(key).cloned())
    }

    async fn save_image(&self, image: &ImageReference) -> Result<(), RepoError> {
        self.state
            .lock()
            .await
            .images
            .insert(image.key.clone(), image.clone());
        Ok(())
    }
}

#[async_trait]
impl GenerationResultRepository for InMemoryStore {
    async fn get_generation_result(&self, task_id: &TaskId) -> Result<GenerationResult, RepoError> {
        self.state
            .lock()
            .await
            .results
            .get(task_id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("GenerationResult", task_id))
    }

    async fn save_generation_result(&self, result: &GenerationResult) -> Result<(), RepoError> {
        self.state
            .lock()
            .await
            .results
            .insert(result.task_id.clone(), result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::{StoryStatus, TaskType};

    fn story() -> PublishedStory {
        PublishedStory::new(UserId::new(), serde_json::json!({}), "en")
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = InMemoryStore::new();
        let story = story();
        let id = story.id;
        let story_snapshot = story.clone();
        store.insert_story(story).await;

        let tx = store.begin().await.unwrap();
        tx.mark_story_failed(id, None, "boom").await.unwrap();
        tx.upsert_scene(&StoryScene::initial(id)).await.unwrap();
        tx.stage_tasks(&[GenerationTask::for_story(TaskType::ProtagonistGoal, &story_snapshot, "")])
            .await
            .unwrap();
        tx.rollback().await;

        assert_eq!(store.get_story(id).await.unwrap().status(), StoryStatus::ModerationPending);
        assert!(store.list_scenes(id).await.unwrap().is_empty());
        assert!(store.list_staged_tasks(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = InMemoryStore::new();
        let story = story();
        let id = story.id;
        store.insert_story(story).await;

        let tx = store.begin().await.unwrap();
        let transition = StepTransition::new(GenerationStep::Moderation, GenerationStep::ProtagonistGoal);
        assert!(matches!(
            tx.transition_story(id, &transition).await.unwrap(),
            Guarded::Applied(_)
        ));
        tx.commit().await.unwrap();

        assert_eq!(store.get_story(id).await.unwrap().step(), GenerationStep::ProtagonistGoal);
    }

    #[tokio::test]
    async fn test_upsert_keeps_scene_identity() {
        let store = InMemoryStore::new();
        let story_id = PublishedStoryId::new();
        let first = store.upsert_scene(&StoryScene::new(story_id, "h1")).await.unwrap();

        let mut replacement = StoryScene::new(story_id, "h1");
        replacement.scene = Some(serde_json::json!({"ch": ["go"]}));
        let second = store.upsert_scene(&replacement).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.list_scenes(story_id).await.unwrap().len(), 1);
        assert!(store
            .find_scene(story_id, "h1")
            .await
            .unwrap()
            .unwrap()
            .has_scene_text());
    }

    #[tokio::test]
    async fn test_mark_failed_respects_expected_step() {
        let store = InMemoryStore::new();
        let story = story();
        let id = story.id;
        store.insert_story(story).await;

        let stale = store
            .mark_story_failed(id, Some(GenerationStep::ScenePlanner), "late")
            .await
            .unwrap();
        assert!(matches!(stale, Guarded::Rejected(_)));
        assert_eq!(store.get_story(id).await.unwrap().status(), StoryStatus::ModerationPending);

        let applied = store
            .mark_story_failed(id, Some(GenerationStep::Moderation), "moderation crashed")
            .await
            .unwrap();
        assert!(matches!(applied, Guarded::Applied(s) if s.status() == StoryStatus::Error));
    }

    #[tokio::test]
    async fn test_staged_tasks_are_listed_oldest_first_until_removed() {
        let store = InMemoryStore::new();
        let story = story();
        let first = GenerationTask::for_story(TaskType::CharacterGeneration, &story, "cast");
        let second = GenerationTask::for_story(TaskType::CharacterImage, &story, "card");
        store.stage_tasks(&[first.clone(), second.clone()]).await.unwrap();

        let listed = store.list_staged_tasks(Utc::now(), 10).await.unwrap();
        assert_eq!(listed, vec![first.clone(), second.clone()]);
        assert_eq!(store.list_staged_tasks(Utc::now(), 1).await.unwrap(), vec![first.clone()]);
        let long_ago = Utc::now() - chrono::Duration::hours(1);
        assert!(store.list_staged_tasks(long_ago, 10).await.unwrap().is_empty());

        store.remove_staged_task(&first.task_id).await.unwrap();
        assert_eq!(store.list_staged_tasks(Utc::now(), 10).await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn test_missing_story_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.get_story(PublishedStoryId::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
