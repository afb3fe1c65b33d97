//! Value objects - Immutable objects defined by their attributes

mod ids;
mod image_key;
mod pipeline;
mod task_type;

pub use ids::*;
pub use image_key::{ImageKey, ImageKind};
pub use pipeline::{
    validate_step_transition, CounterDeltas, GenerationStep, PendingCounters, StoryStatus,
    TransitionError,
};
pub use task_type::{NotificationStatus, TaskType, WireTaskType};

/// State hash of the opening scene of every story
pub const INITIAL_STATE_HASH: &str = "initial";
