//! Strongly-typed identifiers for orchestrated entities

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse an id from its wire form. Empty strings and the nil UUID are rejected.
            pub fn parse(raw: &str) -> Option<Self> {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return None;
                }
                Uuid::parse_str(trimmed)
                    .ok()
                    .filter(|uuid| !uuid.is_nil())
                    .map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Uuid {
                id.0
            }
        }
    };
}

define_id!(StoryConfigId);
define_id!(PublishedStoryId);
define_id!(SceneId);
define_id!(GameStateId);
define_id!(ProgressId);
define_id!(UserId);

/// Identifier of a dispatched generation task.
///
/// Workers echo the id back in their notification, so it is kept as an opaque
/// string rather than forced into a UUID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Mint a fresh task id for a follow-up dispatch
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_blank_and_nil() {
        assert!(PublishedStoryId::parse("").is_none());
        assert!(PublishedStoryId::parse("   ").is_none());
        assert!(PublishedStoryId::parse("00000000-0000-0000-0000-000000000000").is_none());
        assert!(PublishedStoryId::parse("not-a-uuid").is_none());
    }

    #[test]
    fn test_parse_accepts_padded_uuid() {
        let id = PublishedStoryId::new();
        let parsed = PublishedStoryId::parse(&format!("  {}  ", id));
        assert_eq!(parsed, Some(id));
    }

    #[test]
    fn test_task_id_blank() {
        assert!(TaskId::new(" ").is_blank());
        assert!(!TaskId::generate().is_blank());
    }
}
