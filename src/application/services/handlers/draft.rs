//! Narrator output for a draft story config

use tracing::{info, instrument};

use super::{Generated, StageHandlers};
use crate::application::dto::{ClientUpdate, DraftContent};
use crate::application::services::notification_processor::{Handled, ProcessingError};
use crate::domain::entities::{DraftOutcome, DraftStatus, Notification};
use crate::domain::value_objects::StoryConfigId;

impl StageHandlers {
    #[instrument(skip(self, notification), fields(story_config_id = %config_id))]
    pub(crate) async fn handle_draft(
        &self,
        notification: &Notification,
        config_id: StoryConfigId,
    ) -> Result<Handled, ProcessingError> {
        let config = self.store.get_story_config(config_id).await?;
        if config.status != DraftStatus::Generating {
            info!(status = config.status.as_str(), "Draft already settled");
            return Ok(Handled::Stale);
        }

        let text = match self.generated_text(notification).await? {
            Generated::Text(text) => text,
            Generated::Failed(details) => return self.fail_draft(config_id, &details).await,
        };
        let (content, generated) = match DraftContent::parse(&text) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail_draft(config_id, &format!("narrator: {e}")).await,
        };

        let outcome = DraftOutcome::Drafted {
            title: content.title,
            description: content.short_description,
            config: generated,
        };
        match self.store.finish_story_config(config_id, outcome).await? {
            Some(config) => {
                self.outbox.client_update(ClientUpdate::draft(&config));
                Ok(Handled::Applied)
            }
            None => Ok(Handled::Stale),
        }
    }

    async fn fail_draft(&self, config_id: StoryConfigId, details: &str) -> Result<Handled, ProcessingError> {
        match self.errors.handle_draft_error(config_id, details).await? {
            Some(_) => Ok(Handled::Failed),
            None => Ok(Handled::Stale),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use crate::application::ports::outbound::{GenerationResultRepository, StoryConfigRepository};
    use crate::application::services::notification_processor::Handled;
    use crate::domain::entities::{DraftStatus, GenerationResult, Notification, StoryConfig};
    use crate::domain::value_objects::{StoryConfigId, TaskId, UserId};

    async fn draft_notification(h: &Harness, config_id: StoryConfigId, text: &str) -> Notification {
        let task_id = TaskId::generate();
        h.store
            .save_generation_result(&GenerationResult {
                task_id: task_id.clone(),
                generated_text: text.to_string(),
                error: None,
            })
            .await
            .unwrap();
        serde_json::from_value(serde_json::json!({
            "task_id": task_id.as_str(),
            "task_type": "narrator",
            "status": "success",
            "story_config_id": config_id.to_string(),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_narrator_output_fills_draft() {
        let mut h = Harness::new();
        let config = StoryConfig::new(UserId::new());
        let config_id = config.id;
        h.store.insert_story_config(config).await;
        let n = draft_notification(
            &h,
            config_id,
            r#"{"t": "The Drowned Bell", "sd": "A harbor mystery", "gn": "mystery"}"#,
        )
        .await;

        assert_eq!(h.handlers.handle_draft(&n, config_id).await.unwrap(), Handled::Applied);

        let stored = h.store.get_story_config(config_id).await.unwrap();
        assert_eq!(stored.status, DraftStatus::Draft);
        assert_eq!(stored.title.as_deref(), Some("The Drowned Bell"));
        assert_eq!(stored.description.as_deref(), Some("A harbor mystery"));
        assert_eq!(stored.generated_config.unwrap()["gn"], "mystery");
        assert_eq!(client_statuses(&h.messages()), vec!["draft"]);
    }

    #[tokio::test]
    async fn test_untitled_draft_is_an_error() {
        let h = Harness::new();
        let config = StoryConfig::new(UserId::new());
        let config_id = config.id;
        h.store.insert_story_config(config).await;
        let n = draft_notification(&h, config_id, r#"{"sd": "no title"}"#).await;

        assert_eq!(h.handlers.handle_draft(&n, config_id).await.unwrap(), Handled::Failed);
        let stored = h.store.get_story_config(config_id).await.unwrap();
        assert_eq!(stored.status, DraftStatus::Error);
        assert!(stored.error_details.unwrap().starts_with("narrator"));
    }

    #[tokio::test]
    async fn test_settled_draft_is_left_alone() {
        let mut h = Harness::new();
        let mut config = StoryConfig::new(UserId::new());
        config.status = DraftStatus::Draft;
        config.title = Some("Kept".to_string());
        let config_id = config.id;
        h.store.insert_story_config(config).await;
        let n = draft_notification(&h, config_id, r#"{"t": "Replaced"}"#).await;

        assert_eq!(h.handlers.handle_draft(&n, config_id).await.unwrap(), Handled::Stale);
        let stored = h.store.get_story_config(config_id).await.unwrap();
        assert_eq!(stored.title.as_deref(), Some("Kept"));
        assert!(h.messages().is_empty());
    }
}
