//! Processed-task set backing the idempotency guard
//!
//! The SQLite store survives restarts, so a redelivery after a crash is still
//! recognised. The in-memory store is for tests and single-shot runs.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::application::ports::outbound::{IdempotencyStorePort, RepoError};
use crate::domain::value_objects::TaskId;

/// In-memory processed-task set
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    admitted: RwLock<HashSet<TaskId>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStorePort for InMemoryIdempotencyStore {
    async fn insert_if_absent(&self, task_id: &TaskId) -> Result<bool, RepoError> {
        Ok(self.admitted.write().await.insert(task_id.clone()))
    }

    async fn remove(&self, task_id: &TaskId) -> Result<(), RepoError> {
        self.admitted.write().await.remove(task_id);
        Ok(())
    }
}

/// SQLite processed-task set
#[derive(Clone)]
pub struct SqliteIdempotencyStore {
    pool: SqlitePool,
}

impl SqliteIdempotencyStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, RepoError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_tasks (
                task_id TEXT PRIMARY KEY,
                admitted_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| RepoError::database("create processed_tasks", e))?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl IdempotencyStorePort for SqliteIdempotencyStore {
    async fn insert_if_absent(&self, task_id: &TaskId) -> Result<bool, RepoError> {
        // The primary key makes the insert the single point of admission
        let result = sqlx::query(
            "INSERT OR IGNORE INTO processed_tasks (task_id, admitted_at) VALUES (?, ?)",
        )
        .bind(task_id.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| RepoError::database("admit task", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn remove(&self, task_id: &TaskId) -> Result<(), RepoError> {
        sqlx::query("DELETE FROM processed_tasks WHERE task_id = ?")
            .bind(task_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| RepoError::database("release task", e))?;
        Ok(())
    }
}
