//! Image completions: record the URL and settle one fan-out counter

use tracing::{info, instrument, warn};

use super::{settle, story_brief, StageHandlers};
use crate::application::dto::ClientUpdate;
use crate::application::ports::outbound::{finish_transaction, StoreTransaction};
use crate::application::services::counter_engine::{decrement_and_maybe_advance, FanInOutcome};
use crate::application::services::notification_processor::{Handled, ProcessingError};
use crate::application::services::step_manager::StepError;
use crate::domain::entities::{GenerationTask, ImageReference, Notification};
use crate::domain::value_objects::{ImageKey, PublishedStoryId, TaskType};

impl StageHandlers {
    /// A failed image still counts as settled: the empty URL is stored as a
    /// permanent sentinel and the counter is decremented like a success.
    #[instrument(skip(self, notification), fields(published_story_id = %story_id, image_key = %key))]
    pub(crate) async fn handle_image(
        &self,
        notification: &Notification,
        story_id: PublishedStoryId,
        key: ImageKey,
    ) -> Result<Handled, ProcessingError> {
        let story = self.store.get_story(story_id).await?;
        if story.status().is_terminal() {
            info!(status = %story.status(), "Story is terminal, image not counted");
            return Ok(Handled::Stale);
        }
        if !story.are_images_pending() && !story.step().is_fan_out() {
            info!(status = %story.status(), "No images outstanding, ignoring late image");
            return Ok(Handled::Stale);
        }

        let image = match notification.image_url() {
            Some(url) if notification.is_success() => ImageReference::resolved(key.clone(), url),
            _ => ImageReference::failed(key.clone()),
        };
        if !image.is_ready() {
            warn!(details = %notification.error_details(), "Image generation failed, storing sentinel");
        }
        self.store.save_image(&image).await?;

        let tx = self.store.begin().await?;
        let outcome = settle_image(&*tx, story_id, &key).await;
        let Some((outcome, tasks)) = settle(finish_transaction(tx, outcome).await)? else {
            return Ok(Handled::Stale);
        };

        self.publish(&tasks).await;
        if outcome.became_ready() {
            self.announce_story(&outcome.story, true);
        } else if outcome.status_changed() {
            self.outbox.client_update(ClientUpdate::story(&outcome.story));
        }
        Ok(Handled::Applied)
    }
}

/// Decrement the image's counter, staging setup when the pre-setup fan-out just drained
async fn settle_image(
    tx: &dyn StoreTransaction,
    story_id: PublishedStoryId,
    key: &ImageKey,
) -> Result<(FanInOutcome, Vec<GenerationTask>), StepError> {
    let outcome = decrement_and_maybe_advance(tx, story_id, key.completion_delta()).await?;
    let mut tasks = Vec::new();
    if outcome.reached_setup() {
        tasks.push(GenerationTask::for_story(
            TaskType::Setup,
            &outcome.story,
            story_brief(&outcome.story),
        ));
        tx.stage_tasks(&tasks).await?;
    }
    Ok((outcome, tasks))
}
