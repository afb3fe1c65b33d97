//! Storyforge Orchestrator - Notification-driven orchestration of story generation
//!
//! The orchestrator:
//! - Consumes worker completion notifications from the delivery queue
//! - Advances each published story through the generation pipeline
//! - Dispatches follow-up generation tasks, relaying any whose publish failed
//! - Publishes client updates and push notifications through the outbox
//! - Serves health and status over HTTP

mod application;
mod domain;
mod infrastructure;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::application::services::{
    IdempotencyGuard, NotificationProcessor, Outbox, StageHandlers, TaskDispatcher,
};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::consumer::NotificationConsumer;
use crate::infrastructure::http;
use crate::infrastructure::outbox_worker::OutboxWorker;
use crate::infrastructure::persistence::InMemoryStore;
use crate::infrastructure::queues::AdapterFactory;
use crate::infrastructure::state::AppState;
use crate::infrastructure::task_relay::TaskRelay;

/// Spawns a task that cancels the token on SIGTERM/SIGINT
fn setup_shutdown_signal(cancel_token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        cancel_token.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storyforge_orchestrator=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Storyforge Orchestrator");

    let cancel_token = CancellationToken::new();
    setup_shutdown_signal(cancel_token.clone());

    // Load configuration
    let config = AppConfig::from_env()?;
    tracing::info!("Configuration loaded");
    tracing::info!("  Queue backend: {}", config.queue.backend);
    tracing::info!("  Consumer concurrency: {}", config.consumer.concurrency);

    // Transport-facing adapters
    let factory = AdapterFactory::new(config.queue.clone()).await?;
    let queue = factory.create_delivery_queue().await?;
    let processed_tasks = factory.create_idempotency_store().await?;
    let sink = factory.create_message_sink().await?;

    // Orchestration core
    let store = Arc::new(InMemoryStore::new());
    let dispatcher = TaskDispatcher::new(sink.clone(), config.dispatch_timeout);
    let (outbox, outbox_receiver) = Outbox::channel(config.outbox.capacity);
    let handlers = StageHandlers::new(store.clone(), dispatcher.clone(), outbox.clone());
    let processor = NotificationProcessor::new(IdempotencyGuard::new(processed_tasks), handlers);

    let consumer = NotificationConsumer::new(queue.clone(), processor.clone(), config.consumer.clone());
    let state = Arc::new(AppState::new(queue.clone(), processor, outbox, consumer.in_flight()));

    let consumer_task = {
        let cancel = cancel_token.clone();
        tokio::spawn(async move {
            consumer.run(cancel).await;
        })
    };

    // The relay and the outbox keep running until the consumer has settled its last delivery
    let relay_cancel = CancellationToken::new();
    let relay_task = {
        let relay = TaskRelay::new(dispatcher, store, config.relay.clone());
        let cancel = relay_cancel.clone();
        tokio::spawn(async move {
            relay.run(cancel).await;
        })
    };

    let outbox_cancel = CancellationToken::new();
    let outbox_task = {
        let worker = OutboxWorker::new(sink.clone(), sink.clone(), config.outbox.clone());
        let cancel = outbox_cancel.clone();
        tokio::spawn(async move {
            worker.run(outbox_receiver, cancel).await;
        })
    };

    // Build the router
    let app = http::create_routes()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    let server_task = {
        let cancel = cancel_token.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
        })
    };

    cancel_token.cancelled().await;

    if let Err(e) = consumer_task.await {
        tracing::error!("Consumer task failed: {}", e);
    }
    relay_cancel.cancel();
    if let Err(e) = relay_task.await {
        tracing::error!("Task relay failed: {}", e);
    }
    outbox_cancel.cancel();
    if let Err(e) = outbox_task.await {
        tracing::error!("Outbox task failed: {}", e);
    }
    match server_task.await {
        Ok(Err(e)) => tracing::error!("Server error: {}", e),
        Err(e) => tracing::error!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    factory.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
