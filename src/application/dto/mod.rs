//! Data Transfer Objects - decoded worker output and outbound payloads
//!
//! Kept in the application layer so adapters can serialize messages without
//! the domain model knowing about wire shapes.

pub mod generated;
pub mod outbound;

pub use generated::{
    CardSuggestion, CharacterSuggestion, ContentError, DraftContent, GeneratedCharacter,
    ModerationOutcome, ProtagonistGoal, ScenePlan, SetupCharacter, SetupContent,
};
pub use outbound::{ClientUpdate, OutboundMessage, PushNotification, UpdateKind};
