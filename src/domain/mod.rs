//! Domain layer - Pipeline state and the rules governing it, with no I/O
//!
//! This layer contains:
//! - Entities: StoryConfig, PublishedStory, StoryScene, PlayerGameState, PlayerProgress,
//!   ImageReference, GenerationTask, Notification
//! - Value Objects: strongly typed ids, pipeline steps/statuses, task types, image keys

pub mod entities;
pub mod value_objects;
