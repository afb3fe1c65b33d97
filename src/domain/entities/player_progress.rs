//! PlayerProgress entity - a checkpoint of a session in the state graph

use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{ProgressId, PublishedStoryId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerProgress {
    pub id: ProgressId,
    pub user_id: UserId,
    pub story_id: PublishedStoryId,
    pub state_hash: String,
    /// Number of scenes played before reaching this checkpoint
    pub scene_index: u32,
}

impl PlayerProgress {
    pub fn new(
        user_id: UserId,
        story_id: PublishedStoryId,
        state_hash: impl Into<String>,
        scene_index: u32,
    ) -> Self {
        Self {
            id: ProgressId::new(),
            user_id,
            story_id,
            state_hash: state_hash.into(),
            scene_index,
        }
    }
}
