//! Notification - completion report for one dispatched task

use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{NotificationStatus, TaskId, WireTaskType};

/// Decoded notification body. Immutable; may arrive zero, one or many times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub task_id: TaskId,
    pub task_type: WireTaskType,
    pub status: NotificationStatus,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub story_config_id: Option<String>,
    #[serde(default)]
    pub published_story_id: Option<String>,
    #[serde(default)]
    pub state_hash: Option<String>,
    #[serde(default)]
    pub game_state_id: Option<String>,
    #[serde(default)]
    pub image_reference: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub error_details: Option<String>,
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl Notification {
    pub fn is_success(&self) -> bool {
        self.status == NotificationStatus::Success
    }

    pub fn story_config_id(&self) -> Option<&str> {
        present(&self.story_config_id)
    }

    pub fn published_story_id(&self) -> Option<&str> {
        present(&self.published_story_id)
    }

    pub fn state_hash(&self) -> Option<&str> {
        present(&self.state_hash)
    }

    pub fn game_state_id(&self) -> Option<&str> {
        present(&self.game_state_id)
    }

    pub fn image_reference(&self) -> Option<&str> {
        present(&self.image_reference)
    }

    pub fn image_url(&self) -> Option<&str> {
        present(&self.image_url)
    }

    /// Worker-supplied failure detail, with a generic fallback
    pub fn error_details(&self) -> String {
        present(&self.error_details)
            .unwrap_or("generation task failed without details")
            .to_string()
    }
}
