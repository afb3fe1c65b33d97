//! Generation tasks dispatched to workers, and the results they leave behind

use serde::{Deserialize, Serialize};

use crate::domain::entities::PublishedStory;
use crate::domain::value_objects::{
    GameStateId, ImageKey, PublishedStoryId, StoryConfigId, TaskId, TaskType, UserId,
};

/// Aspect ratio requested for character and card portraits
pub const PORTRAIT_RATIO: &str = "2:3";
/// Aspect ratio requested for the story preview image
pub const PREVIEW_RATIO: &str = "3:2";

/// Parameters of an image generation task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub key: ImageKey,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub negative_prompt: String,
    pub ratio: String,
}

/// One unit of AI work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_story_id: Option<PublishedStoryId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_config_id: Option<StoryConfigId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_state_id: Option<GameStateId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub user_input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRequest>,
}

impl GenerationTask {
    /// Text task targeting a published story
    pub fn for_story(task_type: TaskType, story: &PublishedStory, user_input: impl Into<String>) -> Self {
        Self {
            task_id: TaskId::generate(),
            task_type,
            user_id: story.user_id,
            published_story_id: Some(story.id),
            story_config_id: None,
            state_hash: None,
            game_state_id: None,
            language: Some(story.language.clone()),
            user_input: user_input.into(),
            image: None,
        }
    }

    /// Image task for a story-scoped key
    pub fn image(task_type: TaskType, story: &PublishedStory, request: ImageRequest) -> Self {
        let mut task = Self::for_story(task_type, story, request.prompt.clone());
        task.language = None;
        task.image = Some(request);
        task
    }

    pub fn at_state(mut self, state_hash: impl Into<String>) -> Self {
        self.state_hash = Some(state_hash.into());
        self
    }
}

/// Output a worker stored for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub task_id: TaskId,
    pub generated_text: String,
    pub error: Option<String>,
}
