//! Health check and status routes

use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::json;

use crate::infrastructure::state::AppState;

pub async fn health_check() -> &'static str {
    "OK"
}

/// Consumer, transport and outbox figures for operators
pub async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (status, pending) = match state.queue.depth().await {
        Ok(depth) => ("healthy", json!(depth)),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read delivery queue depth");
            ("degraded", serde_json::Value::Null)
        }
    };

    Json(json!({
        "status": status,
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "consumer": {
            "in_flight": state.in_flight(),
        },
        "deliveries": {
            "pending": pending,
        },
        "processing": state.processor.stats(),
        "outbox": {
            "pending": state.outbox.pending(),
            "dropped": state.outbox.dropped(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::outbound::DeliveryQueuePort;
    use crate::infrastructure::http::fixtures::app_state;
    use crate::infrastructure::queues::InMemoryDeliveryQueue;

    #[tokio::test]
    async fn test_status_reports_queue_and_counters() {
        let queue = InMemoryDeliveryQueue::new();
        queue.enqueue(None, b"{}".to_vec()).await.unwrap();
        let state = app_state(&queue);

        let Json(body) = status(State(state)).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["deliveries"]["pending"], 1);
        assert_eq!(body["consumer"]["in_flight"], 0);
        assert_eq!(body["processing"]["applied"], 0);
        assert_eq!(body["outbox"]["dropped"], 0);
    }

    #[tokio::test]
    async fn test_health_check() {
        assert_eq!(health_check().await, "OK");
    }
}
