//! SQLite delivery queue for durable inbound notifications
//!
//! Rows move `pending` -> `processing` -> `acked` | `dead_lettered`. A crash
//! leaves rows in `processing`; opening the queue puts them back to `pending`
//! so they are delivered again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::info;

use crate::application::ports::outbound::{Delivery, DeliveryQueuePort, DeliveryTag, QueueError};

/// SQLite delivery queue
#[derive(Clone)]
pub struct SqliteDeliveryQueue {
    pool: SqlitePool,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl SqliteDeliveryQueue {
    pub async fn new(pool: SqlitePool) -> Result<Self, QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inbound_deliveries (
                tag INTEGER PRIMARY KEY AUTOINCREMENT,
                correlation_id TEXT,
                body BLOB NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_inbound_status
            ON inbound_deliveries(status, tag)
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        let recovered = sqlx::query(
            "UPDATE inbound_deliveries SET status = 'pending', updated_at = ? WHERE status = 'processing'",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?
        .rows_affected();
        if recovered > 0 {
            info!(recovered, "Requeued deliveries left in flight by a previous run");
        }

        Ok(Self {
            pool,
            notify: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<Delivery>, QueueError> {
        // Select and mark in one statement so two receivers never claim the same row
        let row = sqlx::query(
            r#"
            UPDATE inbound_deliveries
            SET status = 'processing', updated_at = ?
            WHERE tag = (
                SELECT tag FROM inbound_deliveries
                WHERE status = 'pending'
                ORDER BY tag ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING tag, correlation_id, body
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let tag: i64 = row
            .try_get("tag")
            .map_err(|e| QueueError::Database(e.to_string()))?;
        let correlation_id: Option<String> = row
            .try_get("correlation_id")
            .map_err(|e| QueueError::Database(e.to_string()))?;
        let body: Vec<u8> = row
            .try_get("body")
            .map_err(|e| QueueError::Database(e.to_string()))?;

        Ok(Some(Delivery {
            tag: tag as DeliveryTag,
            correlation_id,
            body,
        }))
    }

    async fn settle(
        &self,
        tag: DeliveryTag,
        status: &str,
        reason: Option<&str>,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE inbound_deliveries
            SET status = ?, error_message = ?, updated_at = ?
            WHERE tag = ? AND status = 'processing'
            "#,
        )
        .bind(status)
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .bind(tag as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(tag));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryQueuePort for SqliteDeliveryQueue {
    async fn enqueue(
        &self,
        correlation_id: Option<String>,
        body: Vec<u8>,
    ) -> Result<DeliveryTag, QueueError> {
        self.ensure_open()?;
        let now = Utc::now().to_rfc3339();
        let tag = sqlx::query(
            r#"
            INSERT INTO inbound_deliveries (correlation_id, body, status, created_at, updated_at)
            VALUES (?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&correlation_id)
        .bind(&body)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?
        .last_insert_rowid();

        self.notify.notify_one();
        Ok(tag as DeliveryTag)
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            self.ensure_open()?;
            if let Some(delivery) = self.claim_next().await? {
                return Ok(Some(delivery));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // Rows written by other processes are only seen on the next poll
            if tokio::time::timeout(remaining, self.notify.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.settle(tag, "acked", None).await
    }

    async fn reject(&self, tag: DeliveryTag, reason: &str) -> Result<(), QueueError> {
        self.settle(tag, "dead_lettered", Some(reason)).await
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM inbound_deliveries WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;
        Ok(count as usize)
    }

    async fn close(&self) {
        // The pool is shared with other adapters; the factory closes it
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}
