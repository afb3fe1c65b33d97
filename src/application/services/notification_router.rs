//! Notification Router - task type to handler, as a closed enum
//!
//! Validation runs before admission: a notification without a task id or
//! without a usable target id is acknowledged and never reaches a handler.
//! Routing then resolves the extra fields each handler needs.

use thiserror::Error;

use crate::domain::entities::Notification;
use crate::domain::value_objects::{
    GameStateId, ImageKey, PublishedStoryId, StoryConfigId, TaskType, WireTaskType,
    INITIAL_STATE_HASH,
};

/// Non-retryable problems with a notification's shape
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("notification has no task id")]
    MissingTaskId,

    #[error("{task_type} notification has no target id")]
    MissingTarget { task_type: String },

    #[error("malformed {field}: {value:?}")]
    MalformedId { field: &'static str, value: String },

    #[error("image notification has no usable image reference: {0:?}")]
    InvalidImageReference(Option<String>),

    #[error("scene notification without a session must target the initial state, got {0:?}")]
    OrphanScene(Option<String>),

    #[error("scene notification for session {0} has no state hash")]
    MissingStateHash(GameStateId),
}

/// Entity a notification acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Draft(StoryConfigId),
    Story(PublishedStoryId),
}

/// Where a failure lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Story,
    Session(GameStateId),
}

/// Story-level iff the state is the initial one or there is no live session
pub fn determine_error_scope(state_hash: Option<&str>, session: Option<GameStateId>) -> ErrorScope {
    match (state_hash, session) {
        (_, None) => ErrorScope::Story,
        (Some(INITIAL_STATE_HASH), Some(_)) => ErrorScope::Story,
        (_, Some(game_state_id)) => ErrorScope::Session(game_state_id),
    }
}

/// One handler per variant; matched exhaustively by the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Draft(StoryConfigId),
    Moderation(PublishedStoryId),
    ProtagonistGoal(PublishedStoryId),
    ScenePlanner(PublishedStoryId),
    CharacterGeneration(PublishedStoryId),
    Setup(PublishedStoryId),
    Image {
        story_id: PublishedStoryId,
        key: ImageKey,
    },
    InitialScene(PublishedStoryId),
    SessionScene {
        story_id: PublishedStoryId,
        game_state_id: GameStateId,
        state_hash: String,
        game_over: bool,
    },
    JsonGeneration(PublishedStoryId),
    Unknown(String),
}

impl Route {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Draft(_) => "draft",
            Self::Moderation(_) => "moderation",
            Self::ProtagonistGoal(_) => "protagonist_goal",
            Self::ScenePlanner(_) => "scene_planner",
            Self::CharacterGeneration(_) => "character_generation",
            Self::Setup(_) => "setup",
            Self::Image { .. } => "image",
            Self::InitialScene(_) => "initial_scene",
            Self::SessionScene { .. } => "session_scene",
            Self::JsonGeneration(_) => "json_generation",
            Self::Unknown(_) => "unknown",
        }
    }
}

fn parse_field<T>(
    field: &'static str,
    raw: Option<&str>,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, ValidationError> {
    match raw {
        None => Ok(None),
        Some(value) => parse(value).map(Some).ok_or_else(|| ValidationError::MalformedId {
            field,
            value: value.to_string(),
        }),
    }
}

/// Check the task id and resolve the target entity.
///
/// Narrator targets a draft and needs a story config id; every other type
/// targets a published story. Unknown types take whichever id is present.
pub fn resolve_target(notification: &Notification) -> Result<Target, ValidationError> {
    if notification.task_id.is_blank() {
        return Err(ValidationError::MissingTaskId);
    }

    let config_id = parse_field(
        "story_config_id",
        notification.story_config_id(),
        StoryConfigId::parse,
    );
    let story_id = parse_field(
        "published_story_id",
        notification.published_story_id(),
        PublishedStoryId::parse,
    );
    let missing = || ValidationError::MissingTarget {
        task_type: notification.task_type.to_string(),
    };

    match &notification.task_type {
        WireTaskType::Known(task_type) if task_type.targets_draft() => {
            config_id?.map(Target::Draft).ok_or_else(missing)
        }
        WireTaskType::Known(_) => story_id?.map(Target::Story).ok_or_else(missing),
        WireTaskType::Unknown(_) => match config_id? {
            Some(id) => Ok(Target::Draft(id)),
            None => story_id?.map(Target::Story).ok_or_else(missing),
        },
    }
}

/// Map a validated notification to its handler
pub fn route(notification: &Notification, target: Target) -> Result<Route, ValidationError> {
    let task_type = match &notification.task_type {
        WireTaskType::Known(task_type) => *task_type,
        WireTaskType::Unknown(raw) => return Ok(Route::Unknown(raw.clone())),
    };

    let story_id = match target {
        Target::Draft(config_id) => return Ok(Route::Draft(config_id)),
        Target::Story(story_id) => story_id,
    };

    let route = match task_type {
        TaskType::Narrator => {
            return Err(ValidationError::MissingTarget {
                task_type: task_type.to_string(),
            })
        }
        TaskType::ContentModeration => Route::Moderation(story_id),
        TaskType::ProtagonistGoal => Route::ProtagonistGoal(story_id),
        TaskType::ScenePlanner => Route::ScenePlanner(story_id),
        TaskType::CharacterGeneration => Route::CharacterGeneration(story_id),
        TaskType::Setup => Route::Setup(story_id),
        TaskType::CharacterImage | TaskType::PreviewImage => {
            let key = notification
                .image_reference()
                .and_then(ImageKey::from_canonical)
                .ok_or_else(|| {
                    ValidationError::InvalidImageReference(notification.image_reference.clone())
                })?;
            Route::Image { story_id, key }
        }
        TaskType::SceneContinuation | TaskType::GameOver => {
            route_scene(notification, story_id, task_type == TaskType::GameOver)?
        }
        TaskType::JsonGeneration => Route::JsonGeneration(story_id),
    };
    Ok(route)
}

/// Scene continuation and game over share a handler: no session plus the
/// initial hash is the first scene, a session is mid-game.
fn route_scene(
    notification: &Notification,
    story_id: PublishedStoryId,
    game_over: bool,
) -> Result<Route, ValidationError> {
    let session = parse_field(
        "game_state_id",
        notification.game_state_id(),
        GameStateId::parse,
    )?;
    let state_hash = notification.state_hash();

    match session {
        None if state_hash == Some(INITIAL_STATE_HASH) => Ok(Route::InitialScene(story_id)),
        None => Err(ValidationError::OrphanScene(state_hash.map(str::to_string))),
        Some(game_state_id) => {
            let state_hash = state_hash.ok_or(ValidationError::MissingStateHash(game_state_id))?;
            Ok(Route::SessionScene {
                story_id,
                game_state_id,
                state_hash: state_hash.to_string(),
                game_over,
            })
        }
    }
}
