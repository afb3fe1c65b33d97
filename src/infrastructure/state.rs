//! Shared application state

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::application::ports::outbound::DeliveryQueuePort;
use crate::application::services::{NotificationProcessor, Outbox};

/// State behind the health/status routes
pub struct AppState {
    pub queue: Arc<dyn DeliveryQueuePort>,
    pub processor: NotificationProcessor,
    pub outbox: Outbox,
    /// Gauge owned by the consumer loop
    pub in_flight: Arc<AtomicUsize>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        queue: Arc<dyn DeliveryQueuePort>,
        processor: NotificationProcessor,
        outbox: Outbox,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            queue,
            processor,
            outbox,
            in_flight,
            started_at: Utc::now(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}
