//! PlayerGameState entity - one player session of a published story

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{GameStateId, ProgressId, PublishedStoryId, SceneId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    GeneratingScene,
    Playing,
    /// Reached a game-over scene
    Completed,
    Error,
}

impl PlayerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeneratingScene => "generating_scene",
            Self::Playing => "playing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerGameState {
    pub id: GameStateId,
    pub user_id: UserId,
    pub story_id: PublishedStoryId,
    pub status: PlayerStatus,
    pub current_scene_id: Option<SceneId>,
    pub progress_id: ProgressId,
    pub error_details: Option<String>,
    pub ending_text: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PlayerGameState {
    pub fn new(user_id: UserId, story_id: PublishedStoryId, progress_id: ProgressId) -> Self {
        Self {
            id: GameStateId::new(),
            user_id,
            story_id,
            status: PlayerStatus::GeneratingScene,
            current_scene_id: None,
            progress_id,
            error_details: None,
            ending_text: None,
            last_activity_at: Utc::now(),
            completed_at: None,
        }
    }

    /// A freshly generated scene is now playable
    pub fn enter_scene(&mut self, scene_id: SceneId) {
        self.status = PlayerStatus::Playing;
        self.current_scene_id = Some(scene_id);
        self.error_details = None;
        self.last_activity_at = Utc::now();
    }

    /// Game over scene reached
    pub fn complete(&mut self, scene_id: SceneId, ending_text: Option<String>) {
        let now = Utc::now();
        self.status = PlayerStatus::Completed;
        self.current_scene_id = Some(scene_id);
        self.ending_text = ending_text;
        self.error_details = None;
        self.completed_at = Some(now);
        self.last_activity_at = now;
    }

    /// Restore the session to an earlier checkpoint
    pub fn rollback_to(&mut self, progress_id: ProgressId, scene_id: Option<SceneId>) {
        self.status = PlayerStatus::Playing;
        self.progress_id = progress_id;
        self.current_scene_id = scene_id;
        self.error_details = None;
        self.last_activity_at = Utc::now();
    }

    pub fn fail(&mut self, details: impl Into<String>) {
        self.status = PlayerStatus::Error;
        self.error_details = Some(details.into());
        self.last_activity_at = Utc::now();
    }
}
