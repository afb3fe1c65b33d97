//! Application configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Health/status HTTP port
    pub server_port: u16,

    /// Upper bound on publishing one follow-up generation task
    pub dispatch_timeout: Duration,

    pub consumer: ConsumerConfig,
    pub outbox: OutboxConfig,
    pub relay: RelayConfig,
    pub queue: QueueConfig,
}

/// Consumer loop bounds
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Deliveries processed concurrently
    pub concurrency: usize,
    /// Deadline for processing one delivery
    pub handling_timeout: Duration,
    /// How long one receive waits before re-checking for shutdown
    pub receive_poll: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            handling_timeout: Duration::from_secs(60),
            receive_poll: Duration::from_millis(100),
        }
    }
}

/// Outbox delivery of client updates and push notifications
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Messages buffered before new ones are dropped
    pub capacity: usize,
    /// Concurrent publishes
    pub workers: usize,
    pub publish_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            workers: 4,
            publish_timeout: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

/// Re-publishing of staged follow-up tasks whose first publish failed
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Time between passes; tasks younger than one interval are left to their handler
    pub interval: Duration,
    /// Tasks published per pass
    pub batch: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch: 50,
        }
    }
}

/// Which adapters back the transport, dedup set and message sinks
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// "memory" or "sqlite"
    pub backend: String,
    pub sqlite_path: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            sqlite_path: "./data/orchestrator.db".to_string(),
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let consumer_defaults = ConsumerConfig::default();
        let outbox_defaults = OutboxConfig::default();
        let relay_defaults = RelayConfig::default();
        let queue_defaults = QueueConfig::default();

        let concurrency: usize = parse_var("CONSUMER_CONCURRENCY", consumer_defaults.concurrency)?;
        if concurrency == 0 {
            anyhow::bail!("CONSUMER_CONCURRENCY must be at least 1");
        }
        let workers: usize = parse_var("OUTBOX_WORKERS", outbox_defaults.workers)?;
        if workers == 0 {
            anyhow::bail!("OUTBOX_WORKERS must be at least 1");
        }

        Ok(Self {
            server_port: parse_var("SERVER_PORT", 3000u16)
                .context("SERVER_PORT must be a valid port number")?,
            dispatch_timeout: Duration::from_secs(parse_var("DISPATCH_TIMEOUT_SECS", 15u64)?),
            consumer: ConsumerConfig {
                concurrency,
                handling_timeout: Duration::from_secs(parse_var(
                    "HANDLING_TIMEOUT_SECS",
                    consumer_defaults.handling_timeout.as_secs(),
                )?),
                receive_poll: Duration::from_millis(parse_var(
                    "RECEIVE_POLL_MILLIS",
                    consumer_defaults.receive_poll.as_millis() as u64,
                )?),
            },
            outbox: OutboxConfig {
                capacity: parse_var("OUTBOX_CAPACITY", outbox_defaults.capacity)?.max(1),
                workers,
                publish_timeout: Duration::from_secs(parse_var(
                    "OUTBOX_PUBLISH_TIMEOUT_SECS",
                    outbox_defaults.publish_timeout.as_secs(),
                )?),
                max_attempts: parse_var("OUTBOX_MAX_ATTEMPTS", outbox_defaults.max_attempts)?.max(1),
            },
            relay: RelayConfig {
                interval: Duration::from_millis(
                    parse_var("RELAY_INTERVAL_MILLIS", relay_defaults.interval.as_millis() as u64)?.max(10),
                ),
                batch: parse_var("RELAY_BATCH_SIZE", relay_defaults.batch)?.max(1),
            },
            queue: QueueConfig {
                backend: env::var("QUEUE_BACKEND").unwrap_or(queue_defaults.backend),
                sqlite_path: env::var("QUEUE_SQLITE_PATH").unwrap_or(queue_defaults.sqlite_path),
            },
        })
    }
}
