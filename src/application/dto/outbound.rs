//! Outbound message DTOs - client updates and push payloads

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::entities::{PlayerGameState, PublishedStory, StoryConfig};
use crate::domain::value_objects::{SceneId, UserId};

const PUSH_BODY_LIMIT: usize = 150;

/// Which client view an update refreshes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Draft,
    Story,
    GameState,
}

/// Real-time update pushed to a connected client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientUpdate {
    pub entity_id: String,
    pub user_id: UserId,
    pub kind: UpdateKind,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<SceneId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ClientUpdate {
    pub fn draft(config: &StoryConfig) -> Self {
        Self {
            entity_id: config.id.to_string(),
            user_id: config.user_id,
            kind: UpdateKind::Draft,
            status: config.status.as_str().to_string(),
            error_details: config.error_details.clone(),
            scene_id: None,
            title: config.title.clone(),
        }
    }

    pub fn story(story: &PublishedStory) -> Self {
        Self {
            entity_id: story.id.to_string(),
            user_id: story.user_id,
            kind: UpdateKind::Story,
            status: story.status().as_str().to_string(),
            error_details: story.error_details.clone(),
            scene_id: None,
            title: story.title.clone(),
        }
    }

    pub fn game_state(state: &PlayerGameState) -> Self {
        Self {
            entity_id: state.id.to_string(),
            user_id: state.user_id,
            kind: UpdateKind::GameState,
            status: state.status.as_str().to_string(),
            error_details: state.error_details.clone(),
            scene_id: state.current_scene_id,
            title: None,
        }
    }
}

/// Push notification with a flat string data map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushNotification {
    pub user_id: UserId,
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

fn truncate_body(text: &str) -> String {
    if text.chars().count() <= PUSH_BODY_LIMIT {
        text.to_string()
    } else {
        let cut: String = text.chars().take(PUSH_BODY_LIMIT).collect();
        format!("{cut}...")
    }
}

fn story_data(event_type: &str, story: &PublishedStory) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("eventType".to_string(), event_type.to_string()),
        ("publishedStoryId".to_string(), story.id.to_string()),
    ])
}

fn display_title(story: &PublishedStory) -> &str {
    story
        .title
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or("Your story")
}

impl PushNotification {
    pub fn story_ready(story: &PublishedStory) -> Self {
        Self {
            user_id: story.user_id,
            title: "Story ready".to_string(),
            body: format!("{} is ready to play", display_title(story)),
            data: story_data("story_ready", story),
        }
    }

    pub fn story_error(story: &PublishedStory, details: &str) -> Self {
        Self {
            user_id: story.user_id,
            title: "Story Generation Error".to_string(),
            body: truncate_body(details),
            data: story_data("story_error", story),
        }
    }

    pub fn scene_ready(state: &PlayerGameState, story: &PublishedStory) -> Self {
        let mut data = story_data("scene_ready", story);
        data.insert("gameStateId".to_string(), state.id.to_string());
        if let Some(scene_id) = state.current_scene_id {
            data.insert("sceneId".to_string(), scene_id.to_string());
        }
        Self {
            user_id: state.user_id,
            title: display_title(story).to_string(),
            body: "A new scene is ready".to_string(),
            data,
        }
    }

    pub fn session_error(state: &PlayerGameState, details: &str) -> Self {
        Self {
            user_id: state.user_id,
            title: "Scene Generation Error".to_string(),
            body: truncate_body(details),
            data: BTreeMap::from([
                ("eventType".to_string(), "session_error".to_string()),
                ("publishedStoryId".to_string(), state.story_id.to_string()),
                ("gameStateId".to_string(), state.id.to_string()),
            ]),
        }
    }
}

/// A best-effort message queued for the outbox worker
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Client(ClientUpdate),
    Push(PushNotification),
}

impl OutboundMessage {
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Client(_) => "client_update",
            Self::Push(_) => "push_notification",
        }
    }
}
