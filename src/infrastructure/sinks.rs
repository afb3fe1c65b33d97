//! Outbound message sinks
//!
//! Every outbound contract (task dispatch, client updates, push notifications)
//! lands in one channel-tagged log. The broker and push gateway relays read from
//! there; this service only guarantees the write.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::debug;

use crate::application::dto::{ClientUpdate, PushNotification};
use crate::application::ports::outbound::{
    ClientUpdatePublisher, PushNotificationPublisher, TaskPublisher,
};
use crate::domain::entities::GenerationTask;

pub const TASK_CHANNEL: &str = "task";
pub const CLIENT_UPDATE_CHANNEL: &str = "client_update";
pub const PUSH_CHANNEL: &str = "push_notification";

/// Records outbound messages in memory and logs them
#[derive(Default)]
pub struct InMemoryMessageSink {
    messages: RwLock<Vec<(&'static str, serde_json::Value)>>,
}

impl InMemoryMessageSink {
    pub fn new() -> Self {
        Self::default()
    }

    async fn record<T: Serialize>(&self, channel: &'static str, payload: &T) -> Result<()> {
        let value = serde_json::to_value(payload)
            .with_context(|| format!("Failed to serialize {} message", channel))?;
        debug!(channel, payload = %value, "Outbound message recorded");
        self.messages.write().await.push((channel, value));
        Ok(())
    }

    /// Payloads written to one channel, oldest first
    pub async fn messages(&self, channel: &str) -> Vec<serde_json::Value> {
        self.messages
            .read()
            .await
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

/// Appends outbound messages to the `outbound_messages` table
#[derive(Clone)]
pub struct SqliteMessageSink {
    pool: SqlitePool,
}

impl SqliteMessageSink {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbound_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create outbound_messages table")?;

        Ok(Self { pool })
    }

    async fn record<T: Serialize>(&self, channel: &'static str, payload: &T) -> Result<()> {
        let payload_json = serde_json::to_string(payload)
            .with_context(|| format!("Failed to serialize {} message", channel))?;
        sqlx::query(
            "INSERT INTO outbound_messages (channel, payload_json, created_at) VALUES (?, ?, ?)",
        )
        .bind(channel)
        .bind(&payload_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write {} message", channel))?;
        debug!(channel, "Outbound message stored");
        Ok(())
    }
}

// Both sinks expose the same three contracts
macro_rules! impl_publishers {
    ($sink:ty) => {
        #[async_trait]
        impl TaskPublisher for $sink {
            async fn publish_task(&self, task: &GenerationTask) -> Result<()> {
                self.record(TASK_CHANNEL, task).await
            }
        }

        #[async_trait]
        impl ClientUpdatePublisher for $sink {
            async fn publish_client_update(&self, update: &ClientUpdate) -> Result<()> {
                self.record(CLIENT_UPDATE_CHANNEL, update).await
            }
        }

        #[async_trait]
        impl PushNotificationPublisher for $sink {
            async fn publish_push(&self, payload: &PushNotification) -> Result<()> {
                self.record(PUSH_CHANNEL, payload).await
            }
        }
    };
}

impl_publishers!(InMemoryMessageSink);
impl_publishers!(SqliteMessageSink);
