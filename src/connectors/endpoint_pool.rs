//! Create and remove commands shared by providers whose proxies are picked
//! from a list of endpoints instead of being booted.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::ProxyBatch;
use crate::error::{PoolError, Result};
use crate::models::{Connector, ProxyStatus, TaskKind, TaskUpdate};
use crate::tasks::{ProvisionedProxy, TaskCommand, TaskContext};

/// Where a list-backed provider draws endpoints from.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// Up to `count` endpoint keys not present in `in_use`.
    async fn allocate(
        &self,
        ctx: &TaskContext,
        connector: &Connector,
        in_use: &std::collections::HashSet<String>,
        count: usize,
    ) -> Result<Vec<String>>;

    /// Status a freshly allocated proxy starts in.
    fn initial_status(&self) -> ProxyStatus {
        ProxyStatus::Starting
    }
}

/// Command for a create or remove task of a list-backed provider.
pub fn build_command(
    source: Arc<dyn EndpointSource>,
    kind: TaskKind,
) -> Result<Box<dyn TaskCommand>> {
    match kind {
        TaskKind::CreateProxies => Ok(Box::new(CreateEndpoints { source })),
        TaskKind::RemoveProxies => Ok(Box::new(RemoveEndpoints)),
        TaskKind::Install | TaskKind::Uninstall => Err(PoolError::TaskTerminal(format!(
            "{} is not supported by list-backed connectors",
            kind
        ))),
    }
}

/// Single step count of both commands.
pub const ENDPOINT_TASK_STEPS: u32 = 1;

struct CreateEndpoints {
    source: Arc<dyn EndpointSource>,
}

#[async_trait]
impl TaskCommand for CreateEndpoints {
    async fn execute(&mut self, ctx: &TaskContext) -> Result<TaskUpdate> {
        let task = ctx.task();
        let batch = ProxyBatch::from_task(task)?;
        let connector = ctx.get_connector().await?;

        ctx.mark_creating(&batch.proxy_ids).await?;
        let in_use = ctx.keys_in_use(&batch.proxy_ids).await?;
        let keys = self
            .source
            .allocate(ctx, &connector, &in_use, batch.proxy_ids.len())
            .await?;

        let allocated = keys.len();
        let provisioned: Vec<ProvisionedProxy> = batch
            .proxy_ids
            .iter()
            .zip(keys)
            .map(|(id, key)| ProvisionedProxy {
                id: *id,
                name: key.clone(),
                key,
                config: json!({}),
                status: self.source.initial_status(),
            })
            .collect();
        ctx.report_provisioned(provisioned).await?;

        let leftover = &batch.proxy_ids[allocated..];
        if !leftover.is_empty() {
            ctx.discard_proxies(leftover).await?;
        }

        info!(
            connector_id = %connector.id,
            requested = batch.proxy_ids.len(),
            allocated,
            "Endpoints allocated"
        );
        Ok(TaskUpdate::finish(
            task,
            format!(
                "Allocated {} of {} proxies",
                allocated,
                batch.proxy_ids.len()
            ),
            Value::Null,
        ))
    }
}

struct RemoveEndpoints;

#[async_trait]
impl TaskCommand for RemoveEndpoints {
    async fn execute(&mut self, ctx: &TaskContext) -> Result<TaskUpdate> {
        let task = ctx.task();
        let batch = ProxyBatch::from_task(task)?;

        ctx.mark_removing(&batch.proxy_ids).await?;
        let removed = ctx.discard_proxies(&batch.proxy_ids).await?;

        Ok(TaskUpdate::finish(
            task,
            format!("Released {} proxies", removed),
            Value::Null,
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Proxy, Task};
    use crate::repository::{MemoryStore, Store};
    use crate::tasks::TaskTokens;
    use crate::transports::DatacenterTransport;
    use std::collections::HashSet;
    use uuid::Uuid;

    struct FixedSource(Vec<String>);

    #[async_trait]
    impl EndpointSource for FixedSource {
        async fn allocate(
            &self,
            _ctx: &TaskContext,
            _connector: &Connector,
            in_use: &HashSet<String>,
            count: usize,
        ) -> Result<Vec<String>> {
            Ok(self
                .0
                .iter()
                .filter(|key| !in_use.contains(*key))
                .take(count)
                .cloned()
                .collect())
        }
    }

    /// Store with a connector, `count` ToCreate records and a task for them.
    pub(crate) async fn create_setup(
        provider: &str,
        config: Value,
        credential: Value,
        count: usize,
        kind: TaskKind,
    ) -> (Arc<dyn Store>, TaskTokens, Connector, Vec<Proxy>, Task) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let tokens = TaskTokens::new("secret");
        let connector = Connector::new(Uuid::new_v4(), "c", provider, credential, config, 5, 0);
        store.create_connector(&connector).await.unwrap();

        let proxies: Vec<Proxy> = (0..count)
            .map(|_| {
                let mut proxy = Proxy::to_create(connector.project_id, connector.id, provider, 0);
                if kind == TaskKind::RemoveProxies {
                    proxy.status = ProxyStatus::ToRemove;
                }
                proxy
            })
            .collect();
        store.create_proxies(&proxies).await.unwrap();

        let data = ProxyBatch::new(proxies.iter().map(|p| p.id).collect())
            .to_value()
            .unwrap();
        let mut task = Task::new(connector.project_id, connector.id, kind, 1, data, 0);
        task.jwt = tokens.mint(&task).unwrap();
        store.create_task(&task).await.unwrap();
        (store, tokens, connector, proxies, task)
    }

    #[tokio::test]
    async fn test_create_allocates_available_and_discards_rest() {
        let (store, tokens, connector, proxies, task) = create_setup(
            "static-datacenter",
            json!({}),
            json!({}),
            3,
            TaskKind::CreateProxies,
        )
        .await;
        let source = Arc::new(FixedSource(vec![
            "10.0.0.1:3128".to_string(),
            "10.0.0.2:3128".to_string(),
        ]));
        let ctx =
            TaskContext::open(store.clone(), Arc::new(DatacenterTransport), &tokens, task).unwrap();

        let mut command = build_command(source, TaskKind::CreateProxies).unwrap();
        let update = command.execute(&ctx).await.unwrap();
        assert!(!update.running);
        assert_eq!(update.message, "Allocated 2 of 3 proxies");

        let remaining = store
            .list_connector_proxies(connector.project_id, connector.id)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining
            .iter()
            .all(|p| p.status == ProxyStatus::Starting && p.config.is_some()));
        assert!(!remaining.iter().any(|p| p.id == proxies[2].id));
    }

    #[tokio::test]
    async fn test_remove_discards_records() {
        let (store, tokens, connector, _proxies, task) = create_setup(
            "static-datacenter",
            json!({}),
            json!({}),
            2,
            TaskKind::RemoveProxies,
        )
        .await;
        let ctx =
            TaskContext::open(store.clone(), Arc::new(DatacenterTransport), &tokens, task).unwrap();

        let mut command =
            build_command(Arc::new(FixedSource(vec![])), TaskKind::RemoveProxies).unwrap();
        let update = command.execute(&ctx).await.unwrap();
        assert_eq!(update.message, "Released 2 proxies");
        assert!(store
            .list_connector_proxies(connector.project_id, connector.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_install_is_not_supported() {
        let result = build_command(Arc::new(FixedSource(vec![])), TaskKind::Install);
        assert!(matches!(result, Err(PoolError::TaskTerminal(_))));
    }
}
