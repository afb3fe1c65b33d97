//! PublishedStory entity - the pipeline aggregate driven by notifications
//!
//! Step, status and counters are private: they only change through
//! [`PublishedStory::apply_transition`], [`PublishedStory::apply_decrement`] and
//! [`PublishedStory::mark_failed`], each of which re-derives the status so the
//! `(step, status)` pair can never drift apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{
    validate_step_transition, CounterDeltas, GenerationStep, PendingCounters, PublishedStoryId,
    StoryStatus, TransitionError, UserId,
};

/// A story moving through the generation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedStory {
    pub id: PublishedStoryId,
    pub user_id: UserId,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Author configuration the pipeline was started from
    pub config: serde_json::Value,
    /// Setup document accumulated by the pipeline (goal, characters, preview prompt)
    pub setup: serde_json::Value,
    pub language: String,
    pub is_adult_content: bool,
    pub error_details: Option<String>,
    status: StoryStatus,
    step: GenerationStep,
    counters: PendingCounters,
    is_first_scene_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field changes applied together with a step transition
#[derive(Debug, Clone, Default)]
pub struct StoryPatch {
    pub setup: Option<serde_json::Value>,
    pub is_adult_content: Option<bool>,
}

/// How a transition changes the fan-out counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CounterUpdate {
    #[default]
    Keep,
    /// Start a new fan-out with these counters
    Replace(PendingCounters),
    /// Settle finished work and add new work on top of the counters held at
    /// write time. The next step then follows from the remaining work.
    Adjust {
        settled: CounterDeltas,
        added: PendingCounters,
    },
}

/// A compare-and-swap stage change
#[derive(Debug, Clone)]
pub struct StepTransition {
    pub expected: GenerationStep,
    /// Target step; ignored for [`CounterUpdate::Adjust`], which resolves it when applied
    pub next: GenerationStep,
    /// Status the caller expects to result; checked against the derivation rule
    pub status: Option<StoryStatus>,
    pub counters: CounterUpdate,
    pub first_scene_pending: Option<bool>,
    pub patch: StoryPatch,
}

impl StepTransition {
    pub fn new(expected: GenerationStep, next: GenerationStep) -> Self {
        Self {
            expected,
            next,
            status: None,
            counters: CounterUpdate::Keep,
            first_scene_pending: None,
            patch: StoryPatch::default(),
        }
    }

    /// Leave `expected` for whatever stage the remaining fan-out work calls for
    pub fn settle_fan_out(
        expected: GenerationStep,
        settled: CounterDeltas,
        added: PendingCounters,
    ) -> Self {
        let mut transition = Self::new(expected, expected);
        transition.counters = CounterUpdate::Adjust { settled, added };
        transition
    }

    pub fn with_status(mut self, status: StoryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_counters(mut self, counters: PendingCounters) -> Self {
        self.counters = CounterUpdate::Replace(counters);
        self
    }

    pub fn with_first_scene_pending(mut self, pending: bool) -> Self {
        self.first_scene_pending = Some(pending);
        self
    }

    pub fn with_setup(mut self, setup: serde_json::Value) -> Self {
        self.patch.setup = Some(setup);
        self
    }

    pub fn with_adult_content(mut self, is_adult: bool) -> Self {
        self.patch.is_adult_content = Some(is_adult);
        self
    }
}

/// Result of one counter decrement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanInReport {
    /// This decrement took the tracked counters from non-zero to all zero
    pub completed: bool,
    /// At least one counter would have gone negative and was held at zero
    pub clamped: bool,
    pub previous_step: GenerationStep,
    pub previous_status: StoryStatus,
}

impl PublishedStory {
    pub fn new(user_id: UserId, config: serde_json::Value, language: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: PublishedStoryId::new(),
            user_id,
            title: None,
            description: None,
            config,
            setup: serde_json::Value::Null,
            language: language.into(),
            is_adult_content: false,
            error_details: None,
            status: StoryStatus::ModerationPending,
            step: GenerationStep::Moderation,
            counters: PendingCounters::default(),
            is_first_scene_pending: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> StoryStatus {
        self.status
    }

    pub fn step(&self) -> GenerationStep {
        self.step
    }

    pub fn counters(&self) -> PendingCounters {
        self.counters
    }

    pub fn is_first_scene_pending(&self) -> bool {
        self.is_first_scene_pending
    }

    pub fn are_images_pending(&self) -> bool {
        self.counters.images_pending()
    }

    /// Status the derivation rule assigns to the current state
    pub fn derived_status(&self) -> StoryStatus {
        StoryStatus::derive(self.step, &self.counters)
    }

    /// Apply a compare-and-swap stage change.
    ///
    /// Fails without touching the story when the current step differs from the
    /// expected one, the story is terminal, the step change is not in the
    /// transition table, or the requested status disagrees with the derivation.
    pub fn apply_transition(&mut self, transition: &StepTransition) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                status: self.status,
            });
        }
        if self.step != transition.expected {
            return Err(TransitionError::StepMismatch {
                expected: transition.expected,
                actual: self.step,
            });
        }

        let (counters, next) = match transition.counters {
            CounterUpdate::Keep => (self.counters, transition.next),
            CounterUpdate::Replace(counters) => (counters, transition.next),
            CounterUpdate::Adjust { settled, added } => {
                let mut counters = self.counters;
                counters.decrement(&settled);
                counters.add(&added);
                (counters, counters.next_step())
            }
        };
        validate_step_transition(self.step, next)?;

        let derived = StoryStatus::derive(next, &counters);
        if let Some(requested) = transition.status {
            if requested != derived {
                return Err(TransitionError::InconsistentStatus {
                    step: next,
                    requested,
                    derived,
                });
            }
        }

        self.step = next;
        self.counters = counters;
        self.status = derived;
        if let Some(pending) = transition.first_scene_pending {
            self.is_first_scene_pending = pending;
        }
        if let Some(setup) = &transition.patch.setup {
            self.setup = setup.clone();
        }
        if let Some(is_adult) = transition.patch.is_adult_content {
            self.is_adult_content = is_adult;
        }
        self.error_details = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Settle completed sibling sub-tasks.
    ///
    /// During the pre-setup fan-out the step follows the remaining work
    /// (reaching `SetupGeneration` once everything is done); afterwards only the
    /// counters change and the status is re-derived.
    pub fn apply_decrement(&mut self, deltas: &CounterDeltas) -> Result<FanInReport, TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                status: self.status,
            });
        }

        let previous_step = self.step;
        let previous_status = self.status;
        let previous_counters = self.counters;
        let was_pending = !self.counters.all_zero();
        let clamped = self.counters.decrement(deltas);

        if self.counters != previous_counters {
            if self.step.is_fan_out() {
                self.step = self.counters.next_step();
            }
            self.status = self.derived_status();
            self.updated_at = Utc::now();
        }

        Ok(FanInReport {
            completed: was_pending && self.counters.all_zero(),
            clamped,
            previous_step,
            previous_status,
        })
    }

    /// Fail the story if it is still live and, when given, still on `expected`
    pub fn fail_at(
        &mut self,
        expected: Option<GenerationStep>,
        details: impl Into<String>,
    ) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                status: self.status,
            });
        }
        if let Some(expected) = expected.filter(|step| *step != self.step) {
            return Err(TransitionError::StepMismatch {
                expected,
                actual: self.step,
            });
        }
        self.mark_failed(details);
        Ok(())
    }

    /// Terminal failure: status Error with detail, outstanding work abandoned
    pub fn mark_failed(&mut self, details: impl Into<String>) {
        self.status = StoryStatus::Error;
        self.error_details = Some(details.into());
        self.counters = PendingCounters::default();
        self.is_first_scene_pending = false;
        self.updated_at = Utc::now();
    }

    /// Place the story at an arbitrary stage; fixtures only
    #[cfg(test)]
    pub fn at_stage(mut self, step: GenerationStep, counters: PendingCounters) -> Self {
        self.step = step;
        self.counters = counters;
        self.status = StoryStatus::derive(step, &counters);
        self
    }

    #[cfg(test)]
    pub fn with_first_scene_pending(mut self, pending: bool) -> Self {
        self.is_first_scene_pending = pending;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_story() -> PublishedStory {
        PublishedStory::new(UserId::new(), serde_json::json!({"gn": "noir"}), "en")
    }

    #[test]
    fn test_new_story_awaits_moderation() {
        let story = create_test_story();
        assert_eq!(story.step(), GenerationStep::Moderation);
        assert_eq!(story.status(), StoryStatus::ModerationPending);
        assert_eq!(story.status(), story.derived_status());
    }

    #[test]
    fn test_transition_rejects_wrong_expected_step() {
        let mut story = create_test_story();
        let result = story.apply_transition(&StepTransition::new(
            GenerationStep::ProtagonistGoal,
            GenerationStep::ScenePlanner,
        ));
        assert!(matches!(result, Err(TransitionError::StepMismatch { .. })));
        assert_eq!(story.step(), GenerationStep::Moderation);
    }

    #[test]
    fn test_transition_rejects_inconsistent_status() {
        let mut story = create_test_story();
        let result = story.apply_transition(
            &StepTransition::new(GenerationStep::Moderation, GenerationStep::ProtagonistGoal)
                .with_status(StoryStatus::Ready),
        );
        assert!(matches!(
            result,
            Err(TransitionError::InconsistentStatus { .. })
        ));
        assert_eq!(story.status(), StoryStatus::ModerationPending);
    }

    #[test]
    fn test_transition_applies_counters_and_patch() {
        let mut story = create_test_story().at_stage(GenerationStep::ScenePlanner, PendingCounters::default());
        let counters = PendingCounters {
            character_gen: 1,
            card_image: 2,
            character_image: 0,
        };
        story
            .apply_transition(
                &StepTransition::new(GenerationStep::ScenePlanner, counters.next_step())
                    .with_counters(counters)
                    .with_adult_content(true),
            )
            .unwrap();
        assert_eq!(story.step(), GenerationStep::CharacterGeneration);
        assert_eq!(story.status(), StoryStatus::SubTasksPending);
        assert!(story.are_images_pending());
        assert!(story.is_adult_content);
    }

    #[test]
    fn test_decrement_walks_fan_out_to_setup() {
        let mut story = create_test_story().at_stage(
            GenerationStep::CardImageGeneration,
            PendingCounters {
                character_gen: 0,
                card_image: 1,
                character_image: 1,
            },
        );

        let report = story.apply_decrement(&CounterDeltas::card_image(1)).unwrap();
        assert!(!report.completed);
        assert_eq!(story.step(), GenerationStep::CharacterImageGeneration);

        let report = story
            .apply_decrement(&CounterDeltas::character_image(1))
            .unwrap();
        assert!(report.completed);
        assert_eq!(story.step(), GenerationStep::SetupGeneration);
        assert_eq!(story.status(), StoryStatus::SetupPending);
    }

    #[test]
    fn test_duplicate_decrement_is_clamped_and_not_complete_again() {
        let mut story = create_test_story().at_stage(
            GenerationStep::Complete,
            PendingCounters {
                character_gen: 0,
                card_image: 0,
                character_image: 1,
            },
        );
        let first = story
            .apply_decrement(&CounterDeltas::character_image(1))
            .unwrap();
        assert!(first.completed);
        assert_eq!(story.status(), StoryStatus::Ready);

        let second = story
            .apply_decrement(&CounterDeltas::character_image(1))
            .unwrap();
        assert!(second.clamped);
        assert!(!second.completed);
        assert_eq!(story.counters().character_image, 0);
    }

    #[test]
    fn test_settle_fan_out_keeps_concurrent_decrements() {
        let mut story = create_test_story().at_stage(
            GenerationStep::CharacterGeneration,
            PendingCounters {
                character_gen: 1,
                card_image: 1,
                character_image: 0,
            },
        );
        // A card lands while the cast is still being stored
        story.apply_decrement(&CounterDeltas::card_image(1)).unwrap();
        assert_eq!(story.step(), GenerationStep::CharacterGeneration);

        story
            .apply_transition(&StepTransition::settle_fan_out(
                GenerationStep::CharacterGeneration,
                CounterDeltas::character_gen(1),
                PendingCounters {
                    character_image: 2,
                    ..PendingCounters::default()
                },
            ))
            .unwrap();

        assert_eq!(
            story.counters(),
            PendingCounters {
                character_gen: 0,
                card_image: 0,
                character_image: 2,
            }
        );
        assert_eq!(story.step(), GenerationStep::CharacterImageGeneration);
        assert_eq!(story.status(), StoryStatus::ImageGenerationPending);
    }

    #[test]
    fn test_decrement_on_drained_story_leaves_it_untouched() {
        let mut story = create_test_story().at_stage(GenerationStep::Complete, PendingCounters::default());
        let updated_at = story.updated_at;

        let report = story
            .apply_decrement(&CounterDeltas::character_image(1))
            .unwrap();

        assert!(report.clamped);
        assert!(!report.completed);
        assert_eq!(story.updated_at, updated_at);
        assert_eq!(story.status(), StoryStatus::Ready);
    }

    #[test]
    fn test_fail_at_checks_expected_step() {
        let mut story = create_test_story().at_stage(GenerationStep::ScenePlanner, PendingCounters::default());

        let result = story.fail_at(Some(GenerationStep::ProtagonistGoal), "late goal failure");
        assert!(matches!(result, Err(TransitionError::StepMismatch { .. })));
        assert_eq!(story.status(), StoryStatus::ScenePlannerPending);

        story.fail_at(Some(GenerationStep::ScenePlanner), "planner crashed").unwrap();
        assert_eq!(story.status(), StoryStatus::Error);
        assert!(matches!(
            story.fail_at(None, "again"),
            Err(TransitionError::Terminal { .. })
        ));
        assert_eq!(story.error_details.as_deref(), Some("planner crashed"));
    }

    #[test]
    fn test_failed_story_rejects_further_changes() {
        let mut story = create_test_story();
        story.mark_failed("moderation crashed");
        assert_eq!(story.status(), StoryStatus::Error);
        assert!(story
            .apply_decrement(&CounterDeltas::character_image(1))
            .is_err());
        assert!(matches!(
            story.apply_transition(&StepTransition::new(
                GenerationStep::Moderation,
                GenerationStep::ProtagonistGoal
            )),
            Err(TransitionError::Terminal { .. })
        ));
    }
}
