//! Idempotency port - Durable set of admitted task ids

use async_trait::async_trait;

use super::RepoError;
use crate::domain::value_objects::TaskId;

#[async_trait]
pub trait IdempotencyStorePort: Send + Sync {
    /// Insert the task id if absent. True iff this call inserted it.
    async fn insert_if_absent(&self, task_id: &TaskId) -> Result<bool, RepoError>;

    /// Forget an admission so a later redelivery is processed again
    async fn remove(&self, task_id: &TaskId) -> Result<(), RepoError>;
}
