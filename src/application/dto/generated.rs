//! Generated content DTOs - decoding worker output into typed documents
//!
//! Workers return free text that usually, but not always, is a bare JSON
//! document. Markdown fences and chatter around the document are tolerated;
//! anything else is a content error and fails the owning entity.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

/// Generated content could not be used
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("generated content is empty")]
    Missing,
    #[error("generated content is not valid JSON: {0}")]
    Malformed(String),
    #[error("generated content is incomplete: {0}")]
    Invalid(String),
}

/// Locate the JSON document inside generated text
pub fn extract_json(text: &str) -> Option<&str> {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        body = rest.trim_end().strip_suffix("```").unwrap_or(rest).trim();
    }

    let start = body.find(['{', '['])?;
    let close = if body[start..].starts_with('{') { '}' } else { ']' };
    let end = body.rfind(close)?;
    (end > start).then(|| &body[start..=end])
}

/// Decode generated text into `T`
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, ContentError> {
    if text.trim().is_empty() {
        return Err(ContentError::Missing);
    }
    let json = extract_json(text).ok_or_else(|| ContentError::Malformed("no JSON document found".to_string()))?;
    serde_json::from_str(json).map_err(|e| ContentError::Malformed(e.to_string()))
}

fn required(field: &str, value: &str) -> Result<(), ContentError> {
    if value.trim().is_empty() {
        Err(ContentError::Invalid(format!("missing {field}")))
    } else {
        Ok(())
    }
}

/// Booleans arrive as `true`, `1`, or `"true"` depending on the model
fn flexible_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!("not a boolean: {other}"))),
        },
        Value::Null => Ok(false),
        other => Err(serde::de::Error::custom(format!("not a boolean: {other}"))),
    }
}

// =============================================================================
// Draft
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct DraftContent {
    #[serde(rename = "t", default)]
    pub title: String,
    #[serde(rename = "sd", default)]
    pub short_description: String,
}

impl DraftContent {
    /// Returns the decoded draft together with the full document as config
    pub fn parse(text: &str) -> Result<(Self, Value), ContentError> {
        let config: Value = decode(text)?;
        let content: Self =
            serde_json::from_value(config.clone()).map_err(|e| ContentError::Malformed(e.to_string()))?;
        required("title", &content.title)?;
        Ok((content, config))
    }
}

// =============================================================================
// Moderation and protagonist goal
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ModerationOutcome {
    #[serde(rename = "ac", deserialize_with = "flexible_bool")]
    pub is_adult_content: bool,
}

impl ModerationOutcome {
    pub fn parse(text: &str) -> Result<Self, ContentError> {
        let raw: Value = decode(text)?;
        if raw.get("ac").is_none() {
            return Err(ContentError::Invalid("missing ac".to_string()));
        }
        serde_json::from_value(raw).map_err(|e| ContentError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtagonistGoal {
    #[serde(rename = "res", default)]
    pub goal: String,
}

impl ProtagonistGoal {
    pub fn parse(text: &str) -> Result<Self, ContentError> {
        let goal: Self = decode(text)?;
        required("res", &goal.goal)?;
        Ok(goal)
    }
}

// =============================================================================
// Scene planner
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CardSuggestion {
    #[serde(default)]
    pub image_reference_name: String,
    #[serde(default)]
    pub image_prompt_descriptor: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CharacterSuggestion {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenePlan {
    #[serde(default)]
    pub scene_focus: Value,
    #[serde(default)]
    pub new_card_suggestions: Vec<CardSuggestion>,
    #[serde(default)]
    pub new_character_suggestions: Vec<CharacterSuggestion>,
    #[serde(skip)]
    pub document: Value,
}

impl ScenePlan {
    pub fn parse(text: &str) -> Result<Self, ContentError> {
        let document: Value = decode(text)?;
        if !document.is_object() {
            return Err(ContentError::Invalid("plan is not an object".to_string()));
        }
        let mut plan: Self =
            serde_json::from_value(document.clone()).map_err(|e| ContentError::Malformed(e.to_string()))?;
        plan.new_card_suggestions
            .retain(|card| !card.image_reference_name.trim().is_empty() && !card.image_prompt_descriptor.trim().is_empty());
        plan.document = document;
        Ok(plan)
    }

    pub fn wants_characters(&self) -> bool {
        !self.new_character_suggestions.is_empty()
    }
}

// =============================================================================
// Character generation
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
pub struct GeneratedCharacter {
    #[serde(default)]
    pub id: String,
    /// Name
    #[serde(default)]
    pub n: String,
    /// Role
    #[serde(default)]
    pub ro: String,
    /// Description
    #[serde(default)]
    pub d: String,
    /// Motivation
    #[serde(default)]
    pub m: String,
    /// Physical description
    #[serde(default)]
    pub ph: String,
    /// Portrait prompt
    #[serde(default)]
    pub pr: String,
    /// Image reference
    #[serde(default)]
    pub ir: String,
}

impl GeneratedCharacter {
    fn validate(&self) -> Result<(), ContentError> {
        for (field, value) in [
            ("id", &self.id),
            ("n", &self.n),
            ("ro", &self.ro),
            ("d", &self.d),
            ("m", &self.m),
            ("ph", &self.ph),
            ("pr", &self.pr),
            ("ir", &self.ir),
        ] {
            required(field, value)
                .map_err(|_| ContentError::Invalid(format!("character {:?} is missing {field}", self.n)))?;
        }
        Ok(())
    }

    /// Accepts a bare array or an object with a `characters` array
    pub fn parse_all(text: &str) -> Result<Vec<Self>, ContentError> {
        let document: Value = decode(text)?;
        let list = match document {
            Value::Array(_) => document,
            Value::Object(mut map) => map
                .remove("characters")
                .ok_or_else(|| ContentError::Invalid("missing characters".to_string()))?,
            _ => return Err(ContentError::Invalid("characters are not a list".to_string())),
        };
        let characters: Vec<Self> =
            serde_json::from_value(list).map_err(|e| ContentError::Malformed(e.to_string()))?;
        if characters.is_empty() {
            return Err(ContentError::Invalid("no characters generated".to_string()));
        }
        for character in &characters {
            character.validate()?;
        }
        Ok(characters)
    }
}

// =============================================================================
// Setup
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SetupCharacter {
    #[serde(default)]
    pub n: String,
    #[serde(default)]
    pub ir: String,
    #[serde(default)]
    pub pr: String,
    /// Negative prompt
    #[serde(default)]
    pub npr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetupContent {
    #[serde(default)]
    pub chars: Vec<SetupCharacter>,
    /// Story preview image prompt
    #[serde(default)]
    pub spi: String,
    #[serde(skip)]
    pub document: Value,
}

impl SetupContent {
    pub fn parse(text: &str) -> Result<Self, ContentError> {
        let document: Value = decode(text)?;
        if !document.is_object() {
            return Err(ContentError::Invalid("setup is not an object".to_string()));
        }
        let mut setup: Self =
            serde_json::from_value(document.clone()).map_err(|e| ContentError::Malformed(e.to_string()))?;
        setup.document = document;
        Ok(setup)
    }
}

/// Shallow-merge `overlay` into an object copy of `base`
pub fn merge_objects(base: &Value, overlay: &Value) -> Value {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let Value::Object(extra) = overlay {
        for (key, value) in extra {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

// =============================================================================
// Scenes
// =============================================================================

/// Decode and validate a generated scene document.
///
/// A scene needs a non-empty `ch` (choices) array; a game-over scene may
/// instead carry only its ending text `et`.
pub fn parse_scene(text: &str, game_over: bool) -> Result<Value, ContentError> {
    let document: Value = decode(text)?;
    if !document.is_object() {
        return Err(ContentError::Invalid("scene is not an object".to_string()));
    }
    let has_choices = document
        .get("ch")
        .and_then(Value::as_array)
        .is_some_and(|choices| !choices.is_empty());
    let has_ending = document
        .get("et")
        .and_then(Value::as_str)
        .is_some_and(|ending| !ending.trim().is_empty());

    if has_choices || (game_over && (has_ending || document.get("ch").is_some())) {
        Ok(document)
    } else {
        Err(ContentError::Invalid("scene has no choices".to_string()))
    }
}

/// Ending text of a game-over scene
pub fn ending_text(scene: &Value) -> Option<String> {
    scene
        .get("et")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
