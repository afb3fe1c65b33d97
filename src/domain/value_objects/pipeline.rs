//! Pipeline stage model - internal steps, visible statuses and the rules linking them
//!
//! A published story moves through a fixed set of generation stages. The
//! internal [`GenerationStep`] names the stage whose completion the story is
//! waiting on; the externally visible [`StoryStatus`] is never stored
//! independently of it but derived from `(step, counters, flags)` by
//! [`StoryStatus::derive`]. `Error` is the only status allowed to override the rule.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Internal pipeline stage of a published story
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStep {
    Moderation,
    ProtagonistGoal,
    ScenePlanner,
    CharacterGeneration,
    CardImageGeneration,
    CharacterImageGeneration,
    SetupGeneration,
    FirstScene,
    InitialSceneJson,
    Complete,
}

impl GenerationStep {
    /// Steps during which sibling sub-tasks fan out before setup
    pub fn is_fan_out(&self) -> bool {
        matches!(
            self,
            Self::CharacterGeneration | Self::CardImageGeneration | Self::CharacterImageGeneration
        )
    }

    /// Steps allowed to follow `self`
    pub fn successors(&self) -> &'static [GenerationStep] {
        use GenerationStep::*;
        match self {
            Moderation => &[ProtagonistGoal],
            ProtagonistGoal => &[ScenePlanner],
            ScenePlanner => &[CharacterGeneration, CardImageGeneration, SetupGeneration],
            CharacterGeneration => &[
                CardImageGeneration,
                CharacterImageGeneration,
                SetupGeneration,
            ],
            CardImageGeneration => &[CharacterImageGeneration, SetupGeneration],
            CharacterImageGeneration => &[SetupGeneration],
            SetupGeneration => &[FirstScene, Complete],
            FirstScene => &[InitialSceneJson],
            InitialSceneJson => &[Complete],
            Complete => &[],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Moderation => "moderation",
            Self::ProtagonistGoal => "protagonist_goal",
            Self::ScenePlanner => "scene_planner",
            Self::CharacterGeneration => "character_generation",
            Self::CardImageGeneration => "card_image_generation",
            Self::CharacterImageGeneration => "character_image_generation",
            Self::SetupGeneration => "setup_generation",
            Self::FirstScene => "first_scene",
            Self::InitialSceneJson => "initial_scene_json",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for GenerationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible lifecycle state of a published story
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    ModerationPending,
    ProtagonistGoalPending,
    ScenePlannerPending,
    SubTasksPending,
    ImageGenerationPending,
    SetupPending,
    FirstScenePending,
    JsonGenerationPending,
    Ready,
    /// Archived by its owner; never produced by the pipeline itself
    Completed,
    Error,
}

impl StoryStatus {
    /// Derive the visible status from the internal stage and fan-out state
    pub fn derive(step: GenerationStep, counters: &PendingCounters) -> Self {
        match step {
            GenerationStep::Moderation => Self::ModerationPending,
            GenerationStep::ProtagonistGoal => Self::ProtagonistGoalPending,
            GenerationStep::ScenePlanner => Self::ScenePlannerPending,
            GenerationStep::CharacterGeneration => Self::SubTasksPending,
            GenerationStep::CardImageGeneration | GenerationStep::CharacterImageGeneration => {
                Self::ImageGenerationPending
            }
            GenerationStep::SetupGeneration => Self::SetupPending,
            GenerationStep::FirstScene => Self::FirstScenePending,
            GenerationStep::InitialSceneJson => Self::JsonGenerationPending,
            GenerationStep::Complete => {
                if counters.images_pending() {
                    Self::ImageGenerationPending
                } else {
                    Self::Ready
                }
            }
        }
    }

    /// Statuses after which no pipeline notification may act on the story
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModerationPending => "moderation_pending",
            Self::ProtagonistGoalPending => "protagonist_goal_pending",
            Self::ScenePlannerPending => "scene_planner_pending",
            Self::SubTasksPending => "sub_tasks_pending",
            Self::ImageGenerationPending => "image_generation_pending",
            Self::SetupPending => "setup_pending",
            Self::FirstScenePending => "first_scene_pending",
            Self::JsonGenerationPending => "json_generation_pending",
            Self::Ready => "ready",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outstanding sibling sub-tasks of a story
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounters {
    pub character_gen: u32,
    pub card_image: u32,
    pub character_image: u32,
}

impl PendingCounters {
    pub fn images_pending(&self) -> bool {
        self.card_image > 0 || self.character_image > 0
    }

    pub fn all_zero(&self) -> bool {
        self.character_gen == 0 && !self.images_pending()
    }

    /// Apply a decrement, clamping at zero. Returns true when any counter was clamped.
    pub fn decrement(&mut self, deltas: &CounterDeltas) -> bool {
        let mut clamped = false;
        for (counter, delta) in [
            (&mut self.character_gen, deltas.character_gen),
            (&mut self.card_image, deltas.card_image),
            (&mut self.character_image, deltas.character_image),
        ] {
            if delta > *counter {
                clamped = true;
            }
            *counter = counter.saturating_sub(delta);
        }
        clamped
    }

    /// Add newly fanned-out work
    pub fn add(&mut self, other: &PendingCounters) {
        self.character_gen += other.character_gen;
        self.card_image += other.card_image;
        self.character_image += other.character_image;
    }

    /// Stage that follows from the remaining fan-out work
    pub fn next_step(&self) -> GenerationStep {
        if self.character_gen > 0 {
            GenerationStep::CharacterGeneration
        } else if self.card_image > 0 {
            GenerationStep::CardImageGeneration
        } else if self.character_image > 0 {
            GenerationStep::CharacterImageGeneration
        } else {
            GenerationStep::SetupGeneration
        }
    }
}

/// Amounts to subtract from each counter in one atomic update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDeltas {
    pub character_gen: u32,
    pub card_image: u32,
    pub character_image: u32,
}

impl CounterDeltas {
    pub fn character_gen(n: u32) -> Self {
        Self {
            character_gen: n,
            ..Self::default()
        }
    }

    pub fn card_image(n: u32) -> Self {
        Self {
            card_image: n,
            ..Self::default()
        }
    }

    pub fn character_image(n: u32) -> Self {
        Self {
            character_image: n,
            ..Self::default()
        }
    }
}

/// Rejected stage transitions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("story is terminal ({status})")]
    Terminal { status: StoryStatus },
    #[error("current step {actual} does not match expected {expected}")]
    StepMismatch {
        expected: GenerationStep,
        actual: GenerationStep,
    },
    #[error("invalid transition from {from} to {to}")]
    Invalid {
        from: GenerationStep,
        to: GenerationStep,
    },
    #[error("status {requested} is inconsistent with step {step} (derived {derived})")]
    InconsistentStatus {
        step: GenerationStep,
        requested: StoryStatus,
        derived: StoryStatus,
    },
}

/// Check a step change against the transition table.
///
/// Moving to `Complete` is always allowed; staying on the same step is allowed
/// for counter-only updates.
pub fn validate_step_transition(
    from: GenerationStep,
    to: GenerationStep,
) -> Result<(), TransitionError> {
    if to == GenerationStep::Complete || from == to || from.successors().contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::Invalid { from, to })
    }
}
