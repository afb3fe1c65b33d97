//! Generation task types and notification outcome

use serde::{Deserialize, Serialize};

/// Closed set of generation task kinds dispatched to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Narrator,
    Setup,
    ScenePlanner,
    CharacterGeneration,
    SceneContinuation,
    GameOver,
    CharacterImage,
    PreviewImage,
    JsonGeneration,
    ContentModeration,
    ProtagonistGoal,
}

impl TaskType {
    pub const ALL: [TaskType; 11] = [
        TaskType::Narrator,
        TaskType::Setup,
        TaskType::ScenePlanner,
        TaskType::CharacterGeneration,
        TaskType::SceneContinuation,
        TaskType::GameOver,
        TaskType::CharacterImage,
        TaskType::PreviewImage,
        TaskType::JsonGeneration,
        TaskType::ContentModeration,
        TaskType::ProtagonistGoal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Narrator => "narrator",
            Self::Setup => "setup",
            Self::ScenePlanner => "scene_planner",
            Self::CharacterGeneration => "character_generation",
            Self::SceneContinuation => "scene_continuation",
            Self::GameOver => "game_over",
            Self::CharacterImage => "character_image",
            Self::PreviewImage => "preview_image",
            Self::JsonGeneration => "json_generation",
            Self::ContentModeration => "content_moderation",
            Self::ProtagonistGoal => "protagonist_goal",
        }
    }

    /// Parse the wire name; unknown names yield `None`
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw.trim())
    }

    /// Whether this task targets a draft story config rather than a published story
    pub fn targets_draft(&self) -> bool {
        matches!(self, Self::Narrator)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task type as received on the wire, preserving names this build does not know
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireTaskType {
    Known(TaskType),
    Unknown(String),
}

impl From<String> for WireTaskType {
    fn from(raw: String) -> Self {
        match TaskType::parse(&raw) {
            Some(known) => Self::Known(known),
            None => Self::Unknown(raw),
        }
    }
}

impl Serialize for WireTaskType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Known(t) => serializer.serialize_str(t.as_str()),
            Self::Unknown(raw) => serializer.serialize_str(raw),
        }
    }
}

impl<'de> Deserialize<'de> for WireTaskType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

impl std::fmt::Display for WireTaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(t) => write!(f, "{}", t),
            Self::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}

/// Outcome reported by a worker for one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Success,
    Error,
}
