//! Task scheduler
//!
//! Picks due tasks, takes the per-connector execution lock, runs one step of
//! the task command and persists the returned progress. Errors raised by a
//! command are turned into a randomized backoff here and nowhere else.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::command::{Cancellable, TaskCommand};
use super::context::TaskContext;
use super::token::TaskTokens;
use crate::config::TaskRetryConfig;
use crate::connectors::ConnectorRegistry;
use crate::error::{PoolError, Result};
use crate::models::{now_ms, Connector, Task, TaskKind, TaskUpdate};
use crate::repository::Store;
use crate::services::refresh::RefreshJob;
use crate::transports::TransportRegistry;

/// Upper bound of tasks executed in one scheduling round.
const MAX_TASKS_PER_ROUND: usize = 64;

/// Randomized exponential backoff for failed executions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed executions before the task fails
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl From<&TaskRetryConfig> for RetryPolicy {
    fn from(config: &TaskRetryConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): uniform in `[d/2, d)`
    /// with `d = min(base * 2^attempt, max)`, never below 1 ms.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis().max(1) as u64;
        let max = self.max_delay.as_millis().max(2) as u64;
        let ceiling = base
            .saturating_mul(1u64 << attempt.min(32))
            .min(max)
            .max(2);
        let millis = rand::thread_rng().gen_range(ceiling / 2..ceiling).max(1);
        Duration::from_millis(millis)
    }
}

/// Runs task commands one step at a time.
pub struct TaskScheduler {
    store: Arc<dyn Store>,
    connectors: ConnectorRegistry,
    transports: TransportRegistry,
    tokens: TaskTokens,
    policy: RetryPolicy,
    wake: Arc<Notify>,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        connectors: ConnectorRegistry,
        transports: TransportRegistry,
        tokens: TaskTokens,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            connectors,
            transports,
            tokens,
            policy,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Create a task for `connector` and wake the scheduler.
    ///
    /// Fails with `TaskAlreadyRunning` when the connector has a running task.
    pub async fn submit(&self, connector: &Connector, kind: TaskKind, data: Value) -> Result<Task> {
        let provider = self.connectors.get(&connector.provider)?;
        let mut task = Task::new(
            connector.project_id,
            connector.id,
            kind,
            provider.task_steps(kind),
            data,
            now_ms(),
        );
        task.jwt = self.tokens.mint(&task)?;
        self.store.create_task(&task).await?;

        info!(
            task_id = %task.id,
            connector_id = %connector.id,
            kind = %kind,
            "Task submitted"
        );
        self.wake.notify_one();
        Ok(task)
    }

    /// Request cancellation; the next scheduling decision unwinds the task.
    pub async fn cancel(&self, project_id: Uuid, task_id: Uuid) -> Result<Task> {
        let task = self.store.cancel_task(project_id, task_id, now_ms()).await?;
        info!(task_id = %task_id, "Task cancellation requested");
        self.wake.notify_one();
        Ok(task)
    }

    /// Execute every due task once. Returns the number of executions.
    pub async fn run_due(&self, now: i64) -> Result<usize> {
        let mut executed = 0;
        while executed < MAX_TASKS_PER_ROUND {
            match self.run_once(now).await? {
                Some(_) => executed += 1,
                None => break,
            }
        }
        Ok(executed)
    }

    /// Execute one step of the next due task, if any and if its lock is free.
    #[instrument(skip(self))]
    pub async fn run_once(&self, now: i64) -> Result<Option<Task>> {
        let Some(due) = self.store.next_task_to_run(now).await? else {
            return Ok(None);
        };
        if !self.store.lock_task(due.project_id, due.id).await? {
            debug!(task_id = %due.id, "Task is locked, deferring");
            return Ok(None);
        }

        // The cancel flag may have flipped between selection and locking.
        let task = match self.store.get_task(due.project_id, due.id).await {
            Ok(task) => task,
            Err(e) => {
                self.store.release_task(due.project_id, due.id).await?;
                return Err(e);
            }
        };

        let update = match self.execute_locked(&task).await {
            Ok(update) => update,
            Err(e) => self.on_error(&task, e, now).await,
        };

        match self
            .store
            .update_task(task.project_id, task.id, update, now)
            .await
        {
            Ok(updated) => {
                if updated.running {
                    debug!(
                        task_id = %updated.id,
                        step = updated.step_current,
                        step_max = updated.step_max,
                        message = %updated.message,
                        "Task progressed"
                    );
                } else {
                    info!(
                        task_id = %updated.id,
                        connector_id = %updated.connector_id,
                        state = ?updated.state(),
                        message = %updated.message,
                        "Task finished"
                    );
                }
                Ok(Some(updated))
            }
            Err(PoolError::InvalidTaskUpdate(reason)) => {
                error!(task_id = %task.id, "Command returned an invalid update: {}", reason);
                let failed = TaskUpdate::fail(&task, format!("Invalid task update: {}", reason));
                self.store
                    .update_task(task.project_id, task.id, failed, now)
                    .await
                    .map(Some)
            }
            Err(e) => {
                error!(task_id = %task.id, "Failed to persist task update: {}", e);
                self.store.release_task(task.project_id, task.id).await?;
                Err(e)
            }
        }
    }

    async fn execute_locked(&self, task: &Task) -> Result<TaskUpdate> {
        let connector = self
            .store
            .get_connector(task.project_id, task.connector_id)
            .await?;
        let provider = self.connectors.get(&connector.provider)?;
        let transport = self.transports.get(provider.transport())?;
        let ctx = TaskContext::open(self.store.clone(), transport, &self.tokens, task.clone())?;

        let mut command = Cancellable::new(provider.build_task_command(task)?);
        if task.cancelled {
            if let Err(e) = command.cancel(&ctx).await {
                warn!(task_id = %task.id, "Cancel hook failed: {}", e);
            }
        }
        command.execute(&ctx).await
    }

    async fn on_error(&self, task: &Task, e: PoolError, now: i64) -> TaskUpdate {
        if e.is_terminal() {
            error!(task_id = %task.id, "Task failed: {}", e);
            return TaskUpdate::fail(task, e.to_string());
        }

        let cancelled = match self.store.get_task(task.project_id, task.id).await {
            Ok(current) => current.cancelled,
            Err(_) => task.cancelled,
        };
        if cancelled {
            warn!(task_id = %task.id, "Cancelled task errored: {}", e);
            return TaskUpdate::fail(task, e.to_string());
        }

        let attempt = task.retries + 1;
        if attempt >= self.policy.max_attempts {
            error!(task_id = %task.id, attempts = attempt, "Task retries exhausted: {}", e);
            return TaskUpdate::fail(task, e.to_string());
        }

        let delay = self.policy.delay(task.retries);
        warn!(
            task_id = %task.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Task execution failed, retrying: {}",
            e
        );
        TaskUpdate {
            running: true,
            step_current: task.step_current,
            message: format!("Retry {}/{}: {}", attempt, self.policy.max_attempts, e),
            next_retry_ts: now + delay.as_millis() as i64,
            retries: attempt,
            data: task.data.clone(),
        }
    }
}

#[async_trait]
impl RefreshJob for TaskScheduler {
    fn name(&self) -> &'static str {
        "tasks"
    }

    async fn refresh(&self) -> Result<()> {
        let executed = self.run_due(now_ms()).await?;
        if executed > 0 {
            debug!(executed, "Scheduling round complete");
        }
        Ok(())
    }

    fn wake_hint(&self) -> Option<Arc<Notify>> {
        Some(self.wake.clone())
    }
}
