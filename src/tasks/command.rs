use async_trait::async_trait;
use tracing::debug;

use super::context::TaskContext;
use crate::error::Result;
use crate::models::TaskUpdate;

/// One resumable multi-step operation on a provider.
///
/// `execute` performs one unit of work and reports progress; the scheduler
/// calls it again once `next_retry_ts` has elapsed, until `running` is false.
/// Command state lives in the returned `data` and comes back through
/// `ctx.task().data`.
#[async_trait]
pub trait TaskCommand: Send {
    async fn execute(&mut self, ctx: &TaskContext) -> Result<TaskUpdate>;

    /// Best effort unwinding of provider-side work. Never aborts an
    /// in-flight provider call.
    async fn cancel(&mut self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }
}

/// Guarantees that nothing executes after a cancellation request.
pub struct Cancellable {
    inner: Box<dyn TaskCommand>,
    cancelled: bool,
}

impl Cancellable {
    pub fn new(inner: Box<dyn TaskCommand>) -> Self {
        Self {
            inner,
            cancelled: false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

#[async_trait]
impl TaskCommand for Cancellable {
    async fn execute(&mut self, ctx: &TaskContext) -> Result<TaskUpdate> {
        if self.cancelled {
            return Ok(TaskUpdate::cancelled(ctx.task()));
        }
        self.inner.execute(ctx).await
    }

    async fn cancel(&mut self, ctx: &TaskContext) -> Result<()> {
        self.cancelled = true;
        let result = self.inner.cancel(ctx).await;
        if let Err(e) = &result {
            debug!(task_id = %ctx.task().id, error = %e, "Cancel hook failed");
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::PoolError;
    use crate::models::{Connector, Task, TaskKind};
    use crate::repository::{MemoryStore, Store};
    use crate::tasks::TaskTokens;
    use crate::transports::DatacenterTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    /// Command advancing one step per call and counting provider calls.
    pub(crate) struct Stepper {
        pub calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskCommand for Stepper {
        async fn execute(&mut self, ctx: &TaskContext) -> Result<TaskUpdate> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let task = ctx.task();
            if task.step_current + 1 >= task.step_max {
                Ok(TaskUpdate::finish(task, "done", json!({})))
            } else {
                Ok(TaskUpdate::next_step(task, "step", json!({}), 0))
            }
        }
    }

    pub(crate) async fn context() -> TaskContext {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let tokens = TaskTokens::new("secret");
        let connector = Connector::new(Uuid::new_v4(), "c", "p", json!({}), json!({}), 1, 0);
        store.create_connector(&connector).await.unwrap();
        let mut task = Task::new(
            connector.project_id,
            connector.id,
            TaskKind::Install,
            3,
            json!({}),
            0,
        );
        task.jwt = tokens.mint(&task).unwrap();
        TaskContext::open(store, Arc::new(DatacenterTransport), &tokens, task).unwrap()
    }

    #[tokio::test]
    async fn test_execute_after_cancel_terminates() {
        let ctx = context().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let mut command = Cancellable::new(Box::new(Stepper {
            calls: calls.clone(),
        }));

        let update = command.execute(&ctx).await.unwrap();
        assert!(update.running);

        command.cancel(&ctx).await.unwrap();
        let update = command.execute(&ctx).await.unwrap();
        assert!(!update.running);
        assert_eq!(update.message, "Task cancelled");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct FailingCancel;

    #[async_trait]
    impl TaskCommand for FailingCancel {
        async fn execute(&mut self, ctx: &TaskContext) -> Result<TaskUpdate> {
            Ok(TaskUpdate::wait(ctx.task(), "waiting", json!({})))
        }

        async fn cancel(&mut self, _ctx: &TaskContext) -> Result<()> {
            Err(PoolError::Transient("provider unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_cancel_is_terminal_even_when_unwinding_fails() {
        let ctx = context().await;
        let mut command = Cancellable::new(Box::new(FailingCancel));

        assert!(command.cancel(&ctx).await.is_err());
        assert!(command.is_cancelled());
        let update = command.execute(&ctx).await.unwrap();
        assert!(!update.running);
    }
}
