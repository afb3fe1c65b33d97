//! Domain entities - Pipeline objects with identity

mod generation_task;
mod image_reference;
mod notification;
mod player_game_state;
mod player_progress;
mod published_story;
mod story_config;
mod story_scene;

pub use generation_task::{GenerationResult, GenerationTask, ImageRequest, PORTRAIT_RATIO, PREVIEW_RATIO};
pub use image_reference::ImageReference;
pub use notification::Notification;
pub use player_game_state::{PlayerGameState, PlayerStatus};
pub use player_progress::PlayerProgress;
pub use published_story::{FanInReport, PublishedStory, StepTransition, StoryPatch};
pub use story_config::{DraftOutcome, DraftStatus, StoryConfig};
pub use story_scene::StoryScene;
