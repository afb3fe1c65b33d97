//! StoryScene entity - generated content keyed by (story, state hash)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{PublishedStoryId, SceneId, INITIAL_STATE_HASH};

/// One node of the branching game-state graph.
///
/// At most one scene exists per `(story_id, state_hash)`; regeneration
/// updates it in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryScene {
    pub id: SceneId,
    pub story_id: PublishedStoryId,
    pub state_hash: String,
    /// Scene planner output, initial scene only
    pub plan: Option<serde_json::Value>,
    /// Generated characters attached to the initial scene
    pub characters: Vec<serde_json::Value>,
    /// Generated scene text document
    pub scene: Option<serde_json::Value>,
    /// Structured JSON form of the scene
    pub structured: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoryScene {
    pub fn new(story_id: PublishedStoryId, state_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SceneId::new(),
            story_id,
            state_hash: state_hash.into(),
            plan: None,
            characters: Vec::new(),
            scene: None,
            structured: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn initial(story_id: PublishedStoryId) -> Self {
        Self::new(story_id, INITIAL_STATE_HASH)
    }

    /// Whether scene text has already been generated for this node
    pub fn has_scene_text(&self) -> bool {
        self.scene.is_some()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
