//! Infrastructure layer - External adapters and implementations
//!
//! This layer contains:
//! - Config: Application configuration
//! - Persistence: In-memory entity store
//! - Queues: Delivery transport adapters and the adapter factory
//! - Idempotency / Sinks: Processed-task set and outbound message log
//! - Consumer / Outbox worker / Task relay: Background loops
//! - HTTP: Health, status and delivery intake routes
//! - State: Shared application state

pub mod config;
pub mod consumer;
pub mod http;
pub mod idempotency;
pub mod outbox_worker;
pub mod persistence;
pub mod queues;
pub mod sinks;
pub mod state;
pub mod task_relay;
