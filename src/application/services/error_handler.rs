//! Error/Rollback Handler - absorbs domain failures into persisted state
//!
//! Story-level failures are terminal: the story goes to Error and its owner is
//! told. Session-level failures try to roll the session back to the previous
//! checkpoint first and only fail the session when there is none. Each runs
//! in one storage transaction and re-checks that the target is still waiting
//! on the failed work; notifications go out after commit.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::application::dto::{ClientUpdate, PushNotification};
use crate::application::ports::outbound::{
    finish_transaction, Guarded, RepoError, Store, StoreTransaction,
};
use crate::application::services::outbox::Outbox;
use crate::domain::entities::{
    DraftOutcome, PlayerGameState, PlayerProgress, PlayerStatus, PublishedStory, StoryConfig,
    StoryScene,
};
use crate::domain::value_objects::{GameStateId, GenerationStep, PublishedStoryId, StoryConfigId};

#[derive(Clone)]
pub struct ErrorHandler {
    store: Arc<dyn Store>,
    outbox: Outbox,
}

impl ErrorHandler {
    pub fn new(store: Arc<dyn Store>, outbox: Outbox) -> Self {
        Self { store, outbox }
    }

    /// Fail a story for good and notify its owner.
    ///
    /// With `expected` set, only a story still on that step is failed. `None`
    /// when the story already moved on or is terminal.
    #[instrument(skip(self, details), fields(published_story_id = %story_id))]
    pub async fn handle_story_error(
        &self,
        story_id: PublishedStoryId,
        expected: Option<GenerationStep>,
        details: &str,
    ) -> Result<Option<PublishedStory>, RepoError> {
        let tx = self.store.begin().await?;
        let outcome = tx.mark_story_failed(story_id, expected, details).await;
        let story = match finish_transaction(tx, outcome).await? {
            Guarded::Applied(story) => story,
            Guarded::Rejected(reason) => {
                info!(%reason, "Story no longer waiting on the failed stage, ignoring failure");
                return Ok(None);
            }
        };

        error!(step = %story.step(), details, "Story generation failed");
        self.outbox.client_update(ClientUpdate::story(&story));
        self.outbox.push(PushNotification::story_error(&story, details));
        Ok(Some(story))
    }

    /// Roll a session back to its previous checkpoint, or fail it when there is none.
    /// `None` when the session is no longer waiting for a scene.
    #[instrument(skip(self, details), fields(game_state_id = %game_state_id))]
    pub async fn handle_game_state_error(
        &self,
        game_state_id: GameStateId,
        details: &str,
    ) -> Result<Option<PlayerGameState>, RepoError> {
        let tx = self.store.begin().await?;
        let outcome = rollback_session(&*tx, game_state_id, details).await;
        let Some(state) = finish_transaction(tx, outcome).await? else {
            info!("Session already settled, ignoring failure");
            return Ok(None);
        };

        self.outbox.client_update(ClientUpdate::game_state(&state));
        if state.status == PlayerStatus::Error {
            warn!(details, "Session failed without a checkpoint to return to");
            self.outbox.push(PushNotification::session_error(&state, details));
        } else {
            info!(progress_id = %state.progress_id, "Session rolled back to checkpoint");
        }
        Ok(Some(state))
    }

    /// Fail a draft that is still generating. `None` when it already settled.
    #[instrument(skip(self, details), fields(story_config_id = %config_id))]
    pub async fn handle_draft_error(
        &self,
        config_id: StoryConfigId,
        details: &str,
    ) -> Result<Option<StoryConfig>, RepoError> {
        let outcome = DraftOutcome::Failed {
            details: details.to_string(),
        };
        let config = self.store.finish_story_config(config_id, outcome).await?;
        match &config {
            Some(config) => {
                error!(details, "Draft generation failed");
                self.outbox.client_update(ClientUpdate::draft(config));
            }
            None => info!("Draft already settled, ignoring failure"),
        }
        Ok(config)
    }
}

async fn rollback_session(
    tx: &dyn StoreTransaction,
    game_state_id: GameStateId,
    details: &str,
) -> Result<Option<PlayerGameState>, RepoError> {
    let mut state = tx.get_game_state(game_state_id).await?;
    if state.status != PlayerStatus::GeneratingScene {
        return Ok(None);
    }
    let scene_index = match tx.get_progress(state.progress_id).await {
        Ok(progress) => progress.scene_index,
        Err(e) if e.is_not_found() => 0,
        Err(e) => return Err(e),
    };

    let checkpoint = match scene_index.checked_sub(1) {
        Some(previous) => find_checkpoint(tx, &state, previous).await?,
        None => None,
    };

    match checkpoint {
        Some((progress, scene)) => state.rollback_to(progress.id, Some(scene.id)),
        None => state.fail(details),
    }
    tx.save_game_state(&state).await?;
    Ok(Some(state))
}

/// Scan the story's scenes for one whose hash has a progress record at `scene_index`
async fn find_checkpoint(
    tx: &dyn StoreTransaction,
    state: &PlayerGameState,
    scene_index: u32,
) -> Result<Option<(PlayerProgress, StoryScene)>, RepoError> {
    for scene in tx.list_scenes(state.story_id).await? {
        let progress = tx
            .find_progress(state.user_id, state.story_id, &scene.state_hash)
            .await?;
        if let Some(progress) = progress.filter(|p| p.scene_index == scene_index) {
            return Ok(Some((progress, scene)));
        }
    }
    Ok(None)
}
