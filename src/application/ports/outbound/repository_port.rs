//! Repository ports - Storage contracts the orchestrator relies on
//!
//! The orchestrator owns state transitions; storage owns durability. Every
//! read-modify-write of step, status or counters goes through one of the
//! atomic operations here (`transition_story`, `decrement_story_counters`,
//! `mark_story_failed`, `finish_story_config`) so concurrent handlers can
//! never interleave inside an update.
//!
//! Follow-up tasks are staged in the same transaction as the state change that
//! calls for them and removed once published.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::entities::{
    DraftOutcome, FanInReport, GenerationResult, GenerationTask, ImageReference, PlayerGameState,
    PlayerProgress, PublishedStory, StepTransition, StoryConfig, StoryScene,
};
use crate::domain::value_objects::{
    CounterDeltas, GameStateId, GenerationStep, ImageKey, ProgressId, PublishedStoryId,
    StoryConfigId, TaskId, TransitionError, UserId,
};

/// Storage failures
#[derive(Debug, Clone, Error)]
pub enum RepoError {
    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: &'static str, id: String },

    #[error("storage error during {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transaction conflict: {0}")]
    Conflict(String),
}

impl RepoError {
    pub fn not_found(entity_type: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity_type,
            id: id.to_string(),
        }
    }

    pub fn database(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result of an atomic update guarded by a domain precondition
#[derive(Debug, Clone)]
pub enum Guarded<T> {
    Applied(T),
    Rejected(TransitionError),
}

// =============================================================================
// Story Config Repository Port
// =============================================================================

#[async_trait]
pub trait StoryConfigRepository: Send + Sync {
    async fn get_story_config(&self, id: StoryConfigId) -> Result<StoryConfig, RepoError>;

    /// Atomically settle a draft. `None` when the draft was no longer generating.
    async fn finish_story_config(
        &self,
        id: StoryConfigId,
        outcome: DraftOutcome,
    ) -> Result<Option<StoryConfig>, RepoError>;
}

// =============================================================================
// Published Story Repository Port
// =============================================================================

#[async_trait]
pub trait PublishedStoryRepository: Send + Sync {
    async fn get_story(&self, id: PublishedStoryId) -> Result<PublishedStory, RepoError>;

    /// Compare-and-swap on the persisted step, applying the whole transition atomically
    async fn transition_story(
        &self,
        id: PublishedStoryId,
        transition: &StepTransition,
    ) -> Result<Guarded<PublishedStory>, RepoError>;

    /// Decrement fan-out counters and re-derive step/status in one atomic update
    async fn decrement_story_counters(
        &self,
        id: PublishedStoryId,
        deltas: &CounterDeltas,
    ) -> Result<Guarded<(PublishedStory, FanInReport)>, RepoError>;

    /// Set status Error with detail, abandoning outstanding work.
    ///
    /// Rejected when the story is terminal or, if `expected` is given, has
    /// moved off that step.
    async fn mark_story_failed(
        &self,
        id: PublishedStoryId,
        expected: Option<GenerationStep>,
        details: &str,
    ) -> Result<Guarded<PublishedStory>, RepoError>;
}

// =============================================================================
// Story Scene Repository Port
// =============================================================================

#[async_trait]
pub trait StorySceneRepository: Send + Sync {
    async fn find_scene(
        &self,
        story_id: PublishedStoryId,
        state_hash: &str,
    ) -> Result<Option<StoryScene>, RepoError>;

    async fn list_scenes(&self, story_id: PublishedStoryId) -> Result<Vec<StoryScene>, RepoError>;

    /// Insert, or update in place when a scene already exists for (story, hash).
    /// Returns the stored scene, carrying the existing id on update.
    async fn upsert_scene(&self, scene: &StoryScene) -> Result<StoryScene, RepoError>;
}

// =============================================================================
// Player Game State Repository Port
// =============================================================================

#[async_trait]
pub trait PlayerGameStateRepository: Send + Sync {
    async fn get_game_state(&self, id: GameStateId) -> Result<PlayerGameState, RepoError>;

    async fn list_game_states(
        &self,
        story_id: PublishedStoryId,
    ) -> Result<Vec<PlayerGameState>, RepoError>;

    async fn save_game_state(&self, state: &PlayerGameState) -> Result<(), RepoError>;
}

// =============================================================================
// Player Progress Repository Port
// =============================================================================

#[async_trait]
pub trait PlayerProgressRepository: Send + Sync {
    async fn get_progress(&self, id: ProgressId) -> Result<PlayerProgress, RepoError>;

    async fn find_progress(
        &self,
        user_id: UserId,
        story_id: PublishedStoryId,
        state_hash: &str,
    ) -> Result<Option<PlayerProgress>, RepoError>;
}

// =============================================================================
// Image Reference Repository Port
// =============================================================================

#[async_trait]
pub trait ImageReferenceRepository: Send + Sync {
    async fn find_image(&self, key: &ImageKey) -> Result<Option<ImageReference>, RepoError>;

    async fn save_image(&self, image: &ImageReference) -> Result<(), RepoError>;
}

// =============================================================================
// Generation Result Repository Port
// =============================================================================

#[async_trait]
pub trait GenerationResultRepository: Send + Sync {
    async fn get_generation_result(&self, task_id: &TaskId) -> Result<GenerationResult, RepoError>;

    /// Record worker output; workers normally write this themselves
    async fn save_generation_result(&self, result: &GenerationResult) -> Result<(), RepoError>;
}

// =============================================================================
// Staged Task Repository Port
// =============================================================================

#[async_trait]
pub trait StagedTaskRepository: Send + Sync {
    /// Record tasks that must be published once the surrounding write commits
    async fn stage_tasks(&self, tasks: &[GenerationTask]) -> Result<(), RepoError>;

    /// Oldest staged tasks first, limited to those staged before `staged_before`
    async fn list_staged_tasks(
        &self,
        staged_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationTask>, RepoError>;

    async fn remove_staged_task(&self, task_id: &TaskId) -> Result<(), RepoError>;
}

// =============================================================================
// Transactions
// =============================================================================

/// Repositories visible inside one storage transaction
#[async_trait]
pub trait StoreTransaction:
    StoryConfigRepository
    + PublishedStoryRepository
    + StorySceneRepository
    + PlayerGameStateRepository
    + PlayerProgressRepository
    + StagedTaskRepository
{
    async fn commit(self: Box<Self>) -> Result<(), RepoError>;

    async fn rollback(self: Box<Self>);
}

#[async_trait]
pub trait TransactionPort: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, RepoError>;
}

/// Every storage contract, as one handle
pub trait Store:
    StoryConfigRepository
    + PublishedStoryRepository
    + StorySceneRepository
    + PlayerGameStateRepository
    + PlayerProgressRepository
    + StagedTaskRepository
    + ImageReferenceRepository
    + GenerationResultRepository
    + TransactionPort
{
}

impl<T> Store for T where
    T: StoryConfigRepository
        + PublishedStoryRepository
        + StorySceneRepository
        + PlayerGameStateRepository
        + PlayerProgressRepository
        + StagedTaskRepository
        + ImageReferenceRepository
        + GenerationResultRepository
        + TransactionPort
{
}

/// Commit on success, roll back on failure
pub async fn finish_transaction<T, E>(
    tx: Box<dyn StoreTransaction>,
    outcome: Result<T, E>,
) -> Result<T, E>
where
    E: From<RepoError>,
{
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            tx.rollback().await;
            Err(e)
        }
    }
}
