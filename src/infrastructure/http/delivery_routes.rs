//! Delivery intake for bridges that cannot write to the transport directly
//!
//! The body is queued verbatim; decoding and validation happen in the consumer
//! like for any other delivery.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;

use crate::application::ports::outbound::{DeliveryTag, QueueError};
use crate::infrastructure::state::AppState;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Debug, Serialize)]
pub struct DeliveryAccepted {
    pub tag: DeliveryTag,
}

pub async fn enqueue_delivery(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<DeliveryAccepted>), (StatusCode, String)> {
    if body.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Empty delivery body".to_string()));
    }
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from);

    let tag = state
        .queue
        .enqueue(correlation_id, body.to_vec())
        .await
        .map_err(|e| match e {
            QueueError::Closed => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        })?;

    tracing::debug!(delivery_tag = tag, "Delivery accepted over HTTP");
    Ok((StatusCode::ACCEPTED, Json(DeliveryAccepted { tag })))
}
