//! Application services - the orchestration core
//!
//! The [`NotificationProcessor`](notification_processor::NotificationProcessor)
//! is the entry point: it admits a delivery through the idempotency guard,
//! routes it, and runs the matching stage handler. Handlers move stories with
//! the step manager and counter engine, absorb failures through the error
//! handler, dispatch follow-up tasks and queue client/push messages on the outbox.

pub mod counter_engine;
pub mod error_handler;
pub mod handlers;
pub mod idempotency_guard;
pub mod notification_processor;
pub mod notification_router;
pub mod outbox;
pub mod step_manager;
pub mod task_dispatcher;

pub use handlers::StageHandlers;
pub use idempotency_guard::IdempotencyGuard;
pub use notification_processor::{Handled, NotificationProcessor, ProcessingError, StatsSnapshot};
pub use outbox::{Outbox, OutboxReceiver};
pub use task_dispatcher::TaskDispatcher;
