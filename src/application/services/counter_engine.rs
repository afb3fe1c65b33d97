//! Fan-out/fan-in counters
//!
//! A stage that fans out N sibling tasks stores N in the matching counter. Each
//! sibling completion decrements it through one atomic repository update, and
//! only the decrement that drains the last counter reports `all_complete`.
//! Sibling completions that leave work outstanding do nothing else.

use tracing::{info, instrument, warn};

use crate::application::ports::outbound::{Guarded, PublishedStoryRepository};
use crate::application::services::step_manager::StepError;
use crate::domain::entities::PublishedStory;
use crate::domain::value_objects::{CounterDeltas, GenerationStep, PublishedStoryId, StoryStatus};

/// What one decrement did to the story
#[derive(Debug, Clone)]
pub struct FanInOutcome {
    pub story: PublishedStory,
    /// This decrement drained the last outstanding sibling
    pub all_complete: bool,
    pub final_status: StoryStatus,
    pub previous_status: StoryStatus,
    pub previous_step: GenerationStep,
}

impl FanInOutcome {
    /// The pre-setup fan-out just finished and setup must be dispatched
    pub fn reached_setup(&self) -> bool {
        self.all_complete
            && self.previous_step.is_fan_out()
            && self.story.step() == GenerationStep::SetupGeneration
    }

    /// This decrement made the story playable
    pub fn became_ready(&self) -> bool {
        self.all_complete
            && self.final_status == StoryStatus::Ready
            && self.previous_status != StoryStatus::Ready
    }

    pub fn status_changed(&self) -> bool {
        self.final_status != self.previous_status
    }
}

/// Decrement counters and re-derive step and status in one atomic update.
///
/// The status reached when the counters drain is derived from the story's
/// step rather than supplied by the caller. Over-decrements are clamped at
/// zero and logged.
#[instrument(skip(repo), fields(published_story_id = %story_id))]
pub async fn decrement_and_maybe_advance<R>(
    repo: &R,
    story_id: PublishedStoryId,
    deltas: CounterDeltas,
) -> Result<FanInOutcome, StepError>
where
    R: PublishedStoryRepository + ?Sized,
{
    let (story, report) = match repo.decrement_story_counters(story_id, &deltas).await? {
        Guarded::Applied(applied) => applied,
        Guarded::Rejected(reason) => return Err(StepError::Stale { story_id, reason }),
    };

    if report.clamped {
        warn!(
            ?deltas,
            counters = ?story.counters(),
            "Counter decrement went below zero and was clamped; duplicate completion?"
        );
    }
    if report.completed {
        info!(
            step = %story.step(),
            status = %story.status(),
            "All sibling tasks completed"
        );
    }

    Ok(FanInOutcome {
        final_status: story.status(),
        all_complete: report.completed,
        previous_status: report.previous_status,
        previous_step: report.previous_step,
        story,
    })
}
