//! Task dispatcher - publishes follow-up generation tasks
//!
//! Handlers stage follow-up tasks in the transaction that advances the story,
//! then publish them right after commit. A task leaves the staging area only
//! once published; anything that failed is picked up again by
//! [`TaskDispatcher::relay_staged`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::application::ports::outbound::{RepoError, StagedTaskRepository, TaskPublisher};
use crate::domain::entities::GenerationTask;
use crate::domain::value_objects::{TaskId, TaskType};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch of {task_type} task {task_id} timed out after {timeout:?}")]
    Timeout {
        task_id: TaskId,
        task_type: TaskType,
        timeout: Duration,
    },

    #[error("failed to dispatch {task_type} task {task_id}: {cause:#}")]
    Publish {
        task_id: TaskId,
        task_type: TaskType,
        cause: anyhow::Error,
    },
}

#[derive(Clone)]
pub struct TaskDispatcher {
    publisher: Arc<dyn TaskPublisher>,
    timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(publisher: Arc<dyn TaskPublisher>, timeout: Duration) -> Self {
        Self { publisher, timeout }
    }

    #[instrument(skip(self, task), fields(task_id = %task.task_id, task_type = %task.task_type))]
    pub async fn dispatch(&self, task: &GenerationTask) -> Result<(), DispatchError> {
        match tokio::time::timeout(self.timeout, self.publisher.publish_task(task)).await {
            Ok(Ok(())) => {
                debug!("Generation task dispatched");
                Ok(())
            }
            Ok(Err(cause)) => Err(DispatchError::Publish {
                task_id: task.task_id.clone(),
                task_type: task.task_type,
                cause,
            }),
            Err(_) => Err(DispatchError::Timeout {
                task_id: task.task_id.clone(),
                task_type: task.task_type,
                timeout: self.timeout,
            }),
        }
    }

    /// Publish a staged task and clear it from staging
    async fn dispatch_staged<R>(&self, staging: &R, task: &GenerationTask) -> Result<(), DispatchError>
    where
        R: StagedTaskRepository + ?Sized,
    {
        self.dispatch(task).await?;
        if let Err(e) = staging.remove_staged_task(&task.task_id).await {
            // Left staged, so the relay will publish it a second time
            warn!(task_id = %task.task_id, error = %e, "Published task could not be unstaged");
        }
        Ok(())
    }

    /// Publish freshly committed tasks concurrently. Returns how many are
    /// still staged because their publish failed.
    pub async fn publish_staged<R>(&self, staging: &R, tasks: &[GenerationTask]) -> usize
    where
        R: StagedTaskRepository + ?Sized,
    {
        join_all(tasks.iter().map(|task| self.dispatch_staged(staging, task)))
            .await
            .into_iter()
            .filter_map(Result::err)
            .inspect(|e| warn!(error = %e, "Task publish failed, left staged for the relay"))
            .count()
    }

    /// Retry tasks staged before `staged_before`, oldest first. Returns how many were published.
    #[instrument(skip(self, staging))]
    pub async fn relay_staged<R>(
        &self,
        staging: &R,
        staged_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, RepoError>
    where
        R: StagedTaskRepository + ?Sized,
    {
        let mut published = 0;
        for task in staging.list_staged_tasks(staged_before, limit).await? {
            match self.dispatch_staged(staging, &task).await {
                Ok(()) => published += 1,
                Err(e) => {
                    warn!(error = %e, "Relay publish failed, retrying on the next pass");
                    break;
                }
            }
        }
        if published > 0 {
            debug!(published, "Relayed staged tasks");
        }
        Ok(published)
    }
}
