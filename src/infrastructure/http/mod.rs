//! HTTP routes - health, status and delivery intake

mod delivery_routes;
mod status_routes;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::infrastructure::state::AppState;

/// Create all routes
pub fn create_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(status_routes::health_check))
        .route("/status", get(status_routes::status))
        .route("/deliveries", post(delivery_routes::enqueue_delivery))
}
