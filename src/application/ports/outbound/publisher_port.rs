//! Publisher ports - Outbound messaging contracts
//!
//! Task dispatch failures are retryable and surface to the caller. Client and
//! push publishes are best-effort and are only ever driven by the outbox worker.

use anyhow::Result;
use async_trait::async_trait;

use crate::application::dto::{ClientUpdate, PushNotification};
use crate::domain::entities::GenerationTask;

/// Dispatches generation work to the workers
#[async_trait]
pub trait TaskPublisher: Send + Sync {
    async fn publish_task(&self, task: &GenerationTask) -> Result<()>;
}

/// Real-time updates to connected clients
#[async_trait]
pub trait ClientUpdatePublisher: Send + Sync {
    async fn publish_client_update(&self, update: &ClientUpdate) -> Result<()>;
}

/// Mobile/desktop push notifications
#[async_trait]
pub trait PushNotificationPublisher: Send + Sync {
    async fn publish_push(&self, payload: &PushNotification) -> Result<()>;
}
