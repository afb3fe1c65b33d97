//! Ports - Interfaces between the orchestrator and its collaborators

pub mod outbound;
