//! Adapter factory - Creates transport, dedup and sink adapters based on configuration
//!
//! Backends are selected once at startup. The SQLite backend shares one pool
//! across the delivery queue, the processed-task set and the message sink.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::application::dto::{ClientUpdate, PushNotification};
use crate::application::ports::outbound::{
    ClientUpdatePublisher, Delivery, DeliveryQueuePort, DeliveryTag, IdempotencyStorePort,
    PushNotificationPublisher, QueueError, TaskPublisher,
};
use crate::domain::entities::GenerationTask;
use crate::infrastructure::config::QueueConfig;
use crate::infrastructure::idempotency::{InMemoryIdempotencyStore, SqliteIdempotencyStore};
use crate::infrastructure::queues::{InMemoryDeliveryQueue, SqliteDeliveryQueue};
use crate::infrastructure::sinks::{InMemoryMessageSink, SqliteMessageSink};

/// Delivery queue selected at runtime
#[derive(Clone)]
pub enum DeliveryBackend {
    Memory(InMemoryDeliveryQueue),
    Sqlite(SqliteDeliveryQueue),
}

#[async_trait]
impl DeliveryQueuePort for DeliveryBackend {
    async fn enqueue(
        &self,
        correlation_id: Option<String>,
        body: Vec<u8>,
    ) -> Result<DeliveryTag, QueueError> {
        match self {
            DeliveryBackend::Memory(q) => q.enqueue(correlation_id, body).await,
            DeliveryBackend::Sqlite(q) => q.enqueue(correlation_id, body).await,
        }
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        match self {
            DeliveryBackend::Memory(q) => q.receive(wait).await,
            DeliveryBackend::Sqlite(q) => q.receive(wait).await,
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        match self {
            DeliveryBackend::Memory(q) => q.ack(tag).await,
            DeliveryBackend::Sqlite(q) => q.ack(tag).await,
        }
    }

    async fn reject(&self, tag: DeliveryTag, reason: &str) -> Result<(), QueueError> {
        match self {
            DeliveryBackend::Memory(q) => q.reject(tag, reason).await,
            DeliveryBackend::Sqlite(q) => q.reject(tag, reason).await,
        }
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        match self {
            DeliveryBackend::Memory(q) => q.depth().await,
            DeliveryBackend::Sqlite(q) => q.depth().await,
        }
    }

    async fn close(&self) {
        match self {
            DeliveryBackend::Memory(q) => q.close().await,
            DeliveryBackend::Sqlite(q) => q.close().await,
        }
    }
}

/// Message sink selected at runtime
pub enum SinkBackend {
    Memory(InMemoryMessageSink),
    Sqlite(SqliteMessageSink),
}

#[async_trait]
impl TaskPublisher for SinkBackend {
    async fn publish_task(&self, task: &GenerationTask) -> Result<()> {
        match self {
            SinkBackend::Memory(s) => s.publish_task(task).await,
            SinkBackend::Sqlite(s) => s.publish_task(task).await,
        }
    }
}

#[async_trait]
impl ClientUpdatePublisher for SinkBackend {
    async fn publish_client_update(&self, update: &ClientUpdate) -> Result<()> {
        match self {
            SinkBackend::Memory(s) => s.publish_client_update(update).await,
            SinkBackend::Sqlite(s) => s.publish_client_update(update).await,
        }
    }
}

#[async_trait]
impl PushNotificationPublisher for SinkBackend {
    async fn publish_push(&self, payload: &PushNotification) -> Result<()> {
        match self {
            SinkBackend::Memory(s) => s.publish_push(payload).await,
            SinkBackend::Sqlite(s) => s.publish_push(payload).await,
        }
    }
}

/// Factory for the transport-facing adapters
pub struct AdapterFactory {
    config: QueueConfig,
    sqlite_pool: Option<SqlitePool>,
}

impl AdapterFactory {
    /// Create a new adapter factory, connecting to SQLite when selected
    pub async fn new(config: QueueConfig) -> Result<Self> {
        let sqlite_pool = match config.backend.as_str() {
            "sqlite" => {
                // Ensure data directory exists
                if let Some(parent) = std::path::Path::new(&config.sqlite_path).parent() {
                    std::fs::create_dir_all(parent)
                        .context("Failed to create queue database directory")?;
                }

                let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.sqlite_path))
                    .await
                    .context("Failed to connect to SQLite queue database")?;
                tracing::info!("Connected to SQLite queue database: {}", config.sqlite_path);
                Some(pool)
            }
            "memory" => None,
            backend => anyhow::bail!("Unsupported queue backend: {}", backend),
        };

        Ok(Self {
            config,
            sqlite_pool,
        })
    }

    fn pool(&self) -> Result<&SqlitePool> {
        self.sqlite_pool
            .as_ref()
            .context("SQLite pool not initialized")
    }

    /// Create the inbound delivery queue
    pub async fn create_delivery_queue(&self) -> Result<Arc<DeliveryBackend>> {
        let queue = match self.config.backend.as_str() {
            "sqlite" => DeliveryBackend::Sqlite(SqliteDeliveryQueue::new(self.pool()?.clone()).await?),
            _ => DeliveryBackend::Memory(InMemoryDeliveryQueue::new()),
        };
        Ok(Arc::new(queue))
    }

    /// Create the processed-task set
    pub async fn create_idempotency_store(&self) -> Result<Arc<dyn IdempotencyStorePort>> {
        Ok(match self.config.backend.as_str() {
            "sqlite" => Arc::new(SqliteIdempotencyStore::new(self.pool()?.clone()).await?),
            _ => Arc::new(InMemoryIdempotencyStore::new()),
        })
    }

    /// Create the outbound message sink
    pub async fn create_message_sink(&self) -> Result<Arc<SinkBackend>> {
        let sink = match self.config.backend.as_str() {
            "sqlite" => SinkBackend::Sqlite(SqliteMessageSink::new(self.pool()?.clone()).await?),
            _ => SinkBackend::Memory(InMemoryMessageSink::new()),
        };
        Ok(Arc::new(sink))
    }

    /// Close the shared pool once every adapter has stopped
    pub async fn close(&self) {
        if let Some(pool) = &self.sqlite_pool {
            pool.close().await;
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}
