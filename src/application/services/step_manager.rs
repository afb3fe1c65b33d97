//! Step Manager - compare-and-swap stage transitions for published stories
//!
//! Every step change goes through [`atomic_transition`], which delegates to the
//! repository's atomic `transition_story`. The repository re-checks the current
//! step at write time, so two handlers racing on the same expected step see
//! exactly one success and one [`StepError::Stale`].
//!
//! The functions are generic over the repository so the same code runs against
//! the autocommit store and inside a [`StoreTransaction`](crate::application::ports::outbound::StoreTransaction).

use thiserror::Error;
use tracing::{debug, instrument};

use crate::application::ports::outbound::{Guarded, PublishedStoryRepository, RepoError};
use crate::domain::entities::{PublishedStory, StepTransition};
use crate::domain::value_objects::{
    GenerationStep, PendingCounters, PublishedStoryId, StoryStatus, TransitionError,
};

#[derive(Debug, Error)]
pub enum StepError {
    /// The story moved on (or failed) before this update landed
    #[error("stale step on story {story_id}: {reason}")]
    Stale {
        story_id: PublishedStoryId,
        reason: TransitionError,
    },

    /// The requested change breaks the transition table or the status rule
    #[error("rejected transition on story {story_id}: {reason}")]
    InvalidTransition {
        story_id: PublishedStoryId,
        reason: TransitionError,
    },

    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl StepError {
    fn from_rejection(story_id: PublishedStoryId, reason: TransitionError) -> Self {
        match reason {
            TransitionError::StepMismatch { .. } | TransitionError::Terminal { .. } => {
                Self::Stale { story_id, reason }
            }
            TransitionError::Invalid { .. } | TransitionError::InconsistentStatus { .. } => {
                Self::InvalidTransition { story_id, reason }
            }
        }
    }
}

/// Next stage of the pre-setup fan-out, from the work still outstanding
pub fn determine_next_step(counters: &PendingCounters) -> GenerationStep {
    counters.next_step()
}

/// Check a loaded story is still waiting on `expected`.
///
/// Terminal stories and stories on another step are stale for this notification.
pub fn ensure_stage(story: &PublishedStory, expected: GenerationStep) -> Result<(), StepError> {
    if story.status().is_terminal() {
        return Err(StepError::Stale {
            story_id: story.id,
            reason: TransitionError::Terminal {
                status: story.status(),
            },
        });
    }
    if story.step() != expected {
        return Err(StepError::Stale {
            story_id: story.id,
            reason: TransitionError::StepMismatch {
                expected,
                actual: story.step(),
            },
        });
    }
    Ok(())
}

/// Apply a full transition (step, counters, flags, patch) as one atomic unit
#[instrument(skip(repo, transition), fields(from = %transition.expected, to = %transition.next))]
pub async fn atomic_transition<R>(
    repo: &R,
    story_id: PublishedStoryId,
    transition: StepTransition,
) -> Result<PublishedStory, StepError>
where
    R: PublishedStoryRepository + ?Sized,
{
    match repo.transition_story(story_id, &transition).await? {
        Guarded::Applied(story) => {
            debug!(
                published_story_id = %story_id,
                status = %story.status(),
                "Story step advanced"
            );
            Ok(story)
        }
        Guarded::Rejected(reason) => Err(StepError::from_rejection(story_id, reason)),
    }
}

/// Move `expected -> next` and check the caller's expected status against the derivation
pub async fn atomic_update_step_and_status<R>(
    repo: &R,
    story_id: PublishedStoryId,
    expected: GenerationStep,
    next: GenerationStep,
    status: StoryStatus,
) -> Result<PublishedStory, StepError>
where
    R: PublishedStoryRepository + ?Sized,
{
    atomic_transition(
        repo,
        story_id,
        StepTransition::new(expected, next).with_status(status),
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::future::join_all;

    use super::*;
    use crate::domain::value_objects::UserId;
    use crate::infrastructure::persistence::InMemoryStore;

    async fn seeded_store(step: GenerationStep) -> (Arc<InMemoryStore>, PublishedStoryId) {
        let store = Arc::new(InMemoryStore::new());
        let story = PublishedStory::new(UserId::new(), serde_json::json!({}), "en")
            .at_stage(step, PendingCounters::default());
        let id = story.id;
        store.insert_story(story).await;
        (store, id)
    }

    #[tokio::test]
    async fn test_concurrent_transitions_exactly_one_wins() {
        let (store, id) = seeded_store(GenerationStep::Moderation).await;

        let attempts = (0..2).map(|_| {
            let store = store.clone();
            async move {
                atomic_update_step_and_status(
                    &*store,
                    id,
                    GenerationStep::Moderation,
                    GenerationStep::ProtagonistGoal,
                    StoryStatus::ProtagonistGoalPending,
                )
                .await
            }
        });
        let results = join_all(attempts).await;

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let stale = results
            .iter()
            .filter(|r| matches!(r, Err(StepError::Stale { .. })))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(stale, 1);

        let story = store.get_story(id).await.unwrap();
        assert_eq!(story.step(), GenerationStep::ProtagonistGoal);
        assert_eq!(story.status(), StoryStatus::ProtagonistGoalPending);
    }

    #[tokio::test]
    async fn test_inconsistent_status_is_rejected_not_stale() {
        let (store, id) = seeded_store(GenerationStep::Moderation).await;
        let result = atomic_update_step_and_status(
            &*store,
            id,
            GenerationStep::Moderation,
            GenerationStep::ProtagonistGoal,
            StoryStatus::Ready,
        )
        .await;
        assert!(matches!(result, Err(StepError::InvalidTransition { .. })));
        let story = store.get_story(id).await.unwrap();
        assert_eq!(story.step(), GenerationStep::Moderation);
    }

    #[tokio::test]
    async fn test_missing_story_is_repo_error() {
        let store = InMemoryStore::new();
        let result = atomic_update_step_and_status(
            &store,
            PublishedStoryId::new(),
            GenerationStep::Moderation,
            GenerationStep::ProtagonistGoal,
            StoryStatus::ProtagonistGoalPending,
        )
        .await;
        assert!(matches!(result, Err(StepError::Repo(e)) if e.is_not_found()));
    }

    #[test]
    fn test_ensure_stage_flags_terminal_and_mismatch() {
        let mut story = PublishedStory::new(UserId::new(), serde_json::json!({}), "en");
        assert!(ensure_stage(&story, GenerationStep::Moderation).is_ok());
        assert!(matches!(
            ensure_stage(&story, GenerationStep::ScenePlanner),
            Err(StepError::Stale { .. })
        ));
        story.mark_failed("boom");
        assert!(matches!(
            ensure_stage(&story, GenerationStep::Moderation),
            Err(StepError::Stale { .. })
        ));
    }
}
