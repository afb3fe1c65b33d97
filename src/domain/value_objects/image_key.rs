//! Canonical image reference keys
//!
//! Keys are normalized once, when they are minted from generated content, so
//! every later lookup compares canonical strings only.

use serde::{Deserialize, Serialize};

use super::{CounterDeltas, PublishedStoryId};

const CHARACTER_PREFIX: &str = "ch_";
const CARD_PREFIX: &str = "card_";
const PREVIEW_PREFIX: &str = "history_preview_";
const LEGACY_CHARACTER_PREFIXES: [&str; 2] = ["character_", "char_"];

/// What an image key depicts, and therefore which counter it settles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    Character,
    Card,
    StoryPreview,
}

/// Symbolic, canonical key of a generated image
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageKey(String);

fn sanitize(raw: &str) -> Option<String> {
    let name: String = raw
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

impl ImageKey {
    /// Character portrait key; legacy `character_` / `char_` / `ch_` prefixes collapse into `ch_`
    pub fn character(raw: &str) -> Option<Self> {
        let mut name = sanitize(raw)?;
        loop {
            let stripped = LEGACY_CHARACTER_PREFIXES
                .iter()
                .chain(std::iter::once(&CHARACTER_PREFIX))
                .find_map(|prefix| name.strip_prefix(prefix).map(str::to_string));
            match stripped {
                Some(rest) if !rest.is_empty() => name = rest,
                Some(_) => return None,
                None => break,
            }
        }
        Some(Self(format!("{CHARACTER_PREFIX}{name}")))
    }

    /// Planner card key
    pub fn card(raw: &str) -> Option<Self> {
        let name = sanitize(raw)?;
        let name = match name.strip_prefix(CARD_PREFIX) {
            Some("") => return None,
            Some(rest) => rest.to_string(),
            None => name,
        };
        Some(Self(format!("{CARD_PREFIX}{name}")))
    }

    pub fn story_preview(story_id: PublishedStoryId) -> Self {
        Self(format!("{PREVIEW_PREFIX}{story_id}"))
    }

    /// Accept a key echoed back by a worker. Only canonical forms are recognised.
    pub fn from_canonical(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let canonical = [CHARACTER_PREFIX, CARD_PREFIX, PREVIEW_PREFIX]
            .iter()
            .any(|prefix| raw.len() > prefix.len() && raw.starts_with(prefix));
        canonical.then(|| Self(raw.to_string()))
    }

    pub fn kind(&self) -> ImageKind {
        if self.0.starts_with(PREVIEW_PREFIX) {
            ImageKind::StoryPreview
        } else if self.0.starts_with(CARD_PREFIX) {
            ImageKind::Card
        } else {
            ImageKind::Character
        }
    }

    /// Counter decrement owed when this image completes
    pub fn completion_delta(&self) -> CounterDeltas {
        match self.kind() {
            ImageKind::Card => CounterDeltas::card_image(1),
            ImageKind::Character | ImageKind::StoryPreview => CounterDeltas::character_image(1),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ImageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
