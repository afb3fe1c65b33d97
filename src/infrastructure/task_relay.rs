//! Task relay - re-publishes follow-up tasks left staged by a failed publish
//!
//! Handlers stage follow-up tasks in the transaction that advances the story
//! and publish them right after commit. A task whose publish failed stays
//! staged; this loop picks it up on a later pass. Only tasks staged at least
//! one interval ago are considered, so the relay does not race the handler
//! that is still publishing its own tasks.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::application::ports::outbound::StagedTaskRepository;
use crate::application::services::TaskDispatcher;
use crate::infrastructure::config::RelayConfig;

pub struct TaskRelay {
    dispatcher: TaskDispatcher,
    staging: Arc<dyn StagedTaskRepository>,
    config: RelayConfig,
}

impl TaskRelay {
    pub fn new(
        dispatcher: TaskDispatcher,
        staging: Arc<dyn StagedTaskRepository>,
        config: RelayConfig,
    ) -> Self {
        Self {
            dispatcher,
            staging,
            config,
        }
    }

    /// Relay until cancelled, then run one last pass over everything staged
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.config.interval.as_millis() as u64, "Task relay started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let grace = chrono::Duration::from_std(self.config.interval)
                .unwrap_or_else(|_| chrono::Duration::zero());
            self.pass(Utc::now() - grace).await;
        }

        // Handlers have settled by now, so nothing staged is still being published
        self.pass(Utc::now()).await;
        info!("Task relay stopped");
    }

    async fn pass(&self, staged_before: chrono::DateTime<Utc>) -> usize {
        match self
            .dispatcher
            .relay_staged(self.staging.as_ref(), staged_before, self.config.batch)
            .await
        {
            Ok(published) => published,
            Err(e) => {
                error!(error = %e, "Failed to list staged tasks");
                0
            }
        }
    }
}
