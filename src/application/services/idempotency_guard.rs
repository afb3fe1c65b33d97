//! Idempotency Guard - first admission wins
//!
//! Delivery is at-least-once. The guard records each task id in a durable set
//! before any side effect runs; a redelivery of an admitted task is
//! acknowledged without being processed again.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::application::ports::outbound::{IdempotencyStorePort, RepoError};
use crate::domain::value_objects::TaskId;

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStorePort>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStorePort>) -> Self {
        Self { store }
    }

    /// True iff this is the first admission of `task_id`
    pub async fn admit(&self, task_id: &TaskId) -> Result<bool, RepoError> {
        let admitted = self.store.insert_if_absent(task_id).await?;
        if !admitted {
            debug!(task_id = %task_id, "Task already admitted");
        }
        Ok(admitted)
    }

    /// Drop an admission after a retryable failure so a replay can run again
    pub async fn release(&self, task_id: &TaskId) {
        if let Err(e) = self.store.remove(task_id).await {
            warn!(task_id = %task_id, error = %e, "Failed to release task admission");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::idempotency::InMemoryIdempotencyStore;

    #[tokio::test]
    async fn test_second_admission_is_rejected() {
        let guard = IdempotencyGuard::new(Arc::new(InMemoryIdempotencyStore::new()));
        let task_id = TaskId::new("task-1");

        assert!(guard.admit(&task_id).await.unwrap());
        assert!(!guard.admit(&task_id).await.unwrap());
        assert!(guard.admit(&TaskId::new("task-2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_allows_replay() {
        let guard = IdempotencyGuard::new(Arc::new(InMemoryIdempotencyStore::new()));
        let task_id = TaskId::new("task-1");

        assert!(guard.admit(&task_id).await.unwrap());
        guard.release(&task_id).await;
        assert!(guard.admit(&task_id).await.unwrap());
    }
}
