use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::now_ms;
use crate::error::{PoolError, Result};

/// Default delay of a waiting step when a command has no sharper estimate.
pub const WAIT_DELAY_MS: i64 = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Install,
    Uninstall,
    CreateProxies,
    RemoveProxies,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Install => "install",
            TaskKind::Uninstall => "uninstall",
            TaskKind::CreateProxies => "create-proxies",
            TaskKind::RemoveProxies => "remove-proxies",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "install" => Some(TaskKind::Install),
            "uninstall" => Some(TaskKind::Uninstall),
            "create-proxies" => Some(TaskKind::CreateProxies),
            "remove-proxies" => Some(TaskKind::RemoveProxies),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Externally visible state derived from the task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// One asynchronous multi-step operation on a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub connector_id: Uuid,
    pub kind: TaskKind,
    pub running: bool,
    pub cancelled: bool,
    pub locked: bool,
    pub step_current: u32,
    pub step_max: u32,
    pub message: String,
    pub start_at_ts: i64,
    pub end_at_ts: Option<i64>,
    pub next_retry_ts: i64,
    /// Consecutive failed executions since the last successful step
    pub retries: u32,
    /// Command continuation state, owned by the command
    pub data: Value,
    /// Capability token scoping callbacks to this task
    pub jwt: String,
}

impl Task {
    pub fn new(
        project_id: Uuid,
        connector_id: Uuid,
        kind: TaskKind,
        step_max: u32,
        data: Value,
        now: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            connector_id,
            kind,
            running: true,
            cancelled: false,
            locked: false,
            step_current: 0,
            step_max,
            message: String::new(),
            start_at_ts: now,
            end_at_ts: None,
            next_retry_ts: now,
            retries: 0,
            data,
            jwt: String::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        if self.running {
            if self.step_current == 0 && self.retries == 0 && self.message.is_empty() {
                TaskState::Pending
            } else {
                TaskState::Running
            }
        } else if self.cancelled {
            TaskState::Cancelled
        } else if self.step_current == self.step_max {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        }
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.running && !self.locked && self.next_retry_ts <= now
    }

    /// Apply a progress update. Terminal tasks and regressions are rejected.
    pub fn apply_update(&mut self, update: TaskUpdate, now: i64) -> Result<()> {
        if !self.running {
            return Err(PoolError::TaskNotRunning { id: self.id });
        }
        if update.step_current < self.step_current {
            return Err(PoolError::InvalidTaskUpdate(format!(
                "step {} is behind current step {}",
                update.step_current, self.step_current
            )));
        }
        if update.step_current > self.step_max {
            return Err(PoolError::InvalidTaskUpdate(format!(
                "step {} is beyond last step {}",
                update.step_current, self.step_max
            )));
        }

        self.running = update.running;
        self.step_current = update.step_current;
        self.message = update.message;
        self.next_retry_ts = update.next_retry_ts;
        self.retries = update.retries;
        self.data = update.data;

        if !self.running {
            self.end_at_ts = Some(now);
            if self.message.trim().is_empty() {
                self.message = match self.state() {
                    TaskState::Succeeded => "Task completed".to_string(),
                    TaskState::Cancelled => "Task cancelled".to_string(),
                    _ => "Task failed".to_string(),
                };
            }
        }
        Ok(())
    }
}

/// Progress returned by a task command after one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub running: bool,
    pub step_current: u32,
    pub message: String,
    pub next_retry_ts: i64,
    #[serde(default)]
    pub retries: u32,
    pub data: Value,
}

impl TaskUpdate {
    /// Advance to the next step, resuming after `delay_ms`.
    pub fn next_step(task: &Task, message: impl Into<String>, data: Value, delay_ms: i64) -> Self {
        Self {
            running: true,
            step_current: task.step_current + 1,
            message: message.into(),
            next_retry_ts: now_ms() + delay_ms,
            retries: 0,
            data,
        }
    }

    /// Stay on the current step and come back after the default wait.
    pub fn wait(task: &Task, message: impl Into<String>, data: Value) -> Self {
        Self {
            running: true,
            step_current: task.step_current,
            message: message.into(),
            next_retry_ts: now_ms() + WAIT_DELAY_MS,
            retries: 0,
            data,
        }
    }

    /// Successful completion of the last step.
    pub fn finish(task: &Task, message: impl Into<String>, data: Value) -> Self {
        Self {
            running: false,
            step_current: task.step_max,
            message: message.into(),
            next_retry_ts: now_ms(),
            retries: 0,
            data,
        }
    }

    /// Termination without reaching the last step.
    pub fn fail(task: &Task, message: impl Into<String>) -> Self {
        Self {
            running: false,
            step_current: task.step_current,
            message: message.into(),
            next_retry_ts: now_ms(),
            retries: task.retries,
            data: task.data.clone(),
        }
    }

    /// Termination after a cancellation request.
    pub fn cancelled(task: &Task) -> Self {
        Self::fail(task, "Task cancelled")
    }
}

/// Task record exposed to the API. Never carries `data` or `jwt`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: Uuid,
    pub project_id: Uuid,
    pub connector_id: Uuid,
    pub kind: TaskKind,
    pub state: TaskState,
    pub running: bool,
    pub cancelled: bool,
    pub step_current: u32,
    pub step_max: u32,
    pub message: String,
    pub start_at_ts: i64,
    pub end_at_ts: Option<i64>,
    pub next_retry_ts: i64,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            project_id: task.project_id,
            connector_id: task.connector_id,
            kind: task.kind,
            state: task.state(),
            running: task.running,
            cancelled: task.cancelled,
            step_current: task.step_current,
            step_max: task.step_max,
            message: task.message.clone(),
            start_at_ts: task.start_at_ts,
            end_at_ts: task.end_at_ts,
            next_retry_ts: task.next_retry_ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Task {
        Task::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            TaskKind::CreateProxies,
            2,
            json!({ "proxyIds": [] }),
            1_000,
        )
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut task = task();
        let step = TaskUpdate::next_step(&task, "instances requested", json!({}), 0);
        task.apply_update(step, 2_000).unwrap();
        assert_eq!(task.step_current, 1);
        assert_eq!(task.state(), TaskState::Running);

        let mut regression = TaskUpdate::wait(&task, "waiting", json!({}));
        regression.step_current = 0;
        let err = task.apply_update(regression, 3_000).unwrap_err();
        assert!(matches!(err, PoolError::InvalidTaskUpdate(_)));
        assert_eq!(task.step_current, 1);
    }

    #[test]
    fn test_no_update_after_termination() {
        let mut task = task();
        task.apply_update(TaskUpdate::finish(&task, "Proxies created", json!({})), 2_000)
            .unwrap();
        assert_eq!(task.state(), TaskState::Succeeded);
        assert_eq!(task.end_at_ts, Some(2_000));

        let late = TaskUpdate::wait(&task, "late", json!({}));
        let err = task.apply_update(late, 3_000).unwrap_err();
        assert!(matches!(err, PoolError::TaskNotRunning { .. }));
        assert_eq!(task.message, "Proxies created");
    }

    #[test]
    fn test_terminal_update_always_has_message() {
        let mut task = task();
        let mut update = TaskUpdate::fail(&task, "");
        update.message = "   ".to_string();
        task.apply_update(update, 2_000).unwrap();

        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.message, "Task failed");
    }

    #[test]
    fn test_wait_uses_default_delay() {
        let task = task();
        let before = now_ms();
        let update = TaskUpdate::wait(&task, "booting", json!({}));

        assert!(update.running);
        assert_eq!(update.step_current, task.step_current);
        assert!(update.next_retry_ts >= before + WAIT_DELAY_MS);
    }

    #[test]
    fn test_step_beyond_max_is_rejected() {
        let mut task = task();
        let mut update = TaskUpdate::next_step(&task, "", json!({}), 0);
        update.step_current = 5;
        assert!(task.apply_update(update, 2_000).is_err());
    }

    #[test]
    fn test_view_hides_data_and_token() {
        let mut task = task();
        task.jwt = "token".to_string();
        let view = serde_json::to_value(TaskView::from(&task)).unwrap();

        assert!(view.get("data").is_none());
        assert!(view.get("jwt").is_none());
        assert_eq!(view["state"], "pending");
        assert_eq!(view["kind"], "create-proxies");
    }
}
