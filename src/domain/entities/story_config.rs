//! StoryConfig entity - a draft produced by the narrator before publication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{StoryConfigId, UserId};

/// Lifecycle of a draft. Only `Generating` is mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Generating,
    Draft,
    Error,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generating => "generating",
            Self::Draft => "draft",
            Self::Error => "error",
        }
    }
}

/// How a narrator run ended
#[derive(Debug, Clone, PartialEq)]
pub enum DraftOutcome {
    Drafted {
        title: String,
        description: String,
        config: serde_json::Value,
    },
    Failed {
        details: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryConfig {
    pub id: StoryConfigId,
    pub user_id: UserId,
    pub status: DraftStatus,
    pub title: Option<String>,
    pub description: Option<String>,
    pub generated_config: Option<serde_json::Value>,
    pub error_details: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StoryConfig {
    pub fn new(user_id: UserId) -> Self {
        Self {
            id: StoryConfigId::new(),
            user_id,
            status: DraftStatus::Generating,
            title: None,
            description: None,
            generated_config: None,
            error_details: None,
            updated_at: Utc::now(),
        }
    }

    /// Settle a generation run. Returns false, leaving the draft untouched,
    /// when it is no longer `Generating`.
    pub fn finish(&mut self, outcome: DraftOutcome) -> bool {
        if self.status != DraftStatus::Generating {
            return false;
        }
        match outcome {
            DraftOutcome::Drafted {
                title,
                description,
                config,
            } => {
                self.status = DraftStatus::Draft;
                self.title = Some(title);
                self.description = Some(description);
                self.generated_config = Some(config);
                self.error_details = None;
            }
            DraftOutcome::Failed { details } => {
                self.status = DraftStatus::Error;
                self.error_details = Some(details);
            }
        }
        self.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_only_while_generating() {
        let mut config = StoryConfig::new(UserId::new());
        assert!(config.finish(DraftOutcome::Failed {
            details: "timeout".to_string()
        }));
        assert_eq!(config.status, DraftStatus::Error);

        let applied = config.finish(DraftOutcome::Drafted {
            title: "Late".to_string(),
            description: "arrives after failure".to_string(),
            config: serde_json::json!({}),
        });
        assert!(!applied);
        assert_eq!(config.status, DraftStatus::Error);
        assert!(config.title.is_none());
    }
}
