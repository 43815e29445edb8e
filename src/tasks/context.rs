use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::token::{TaskClaims, TaskTokens};
use crate::error::{PoolError, Result};
use crate::models::{now_ms, Connector, FreeProxy, Proxy, ProxyStatus, Task};
use crate::repository::Store;
use crate::transports::Transport;

/// A proxy a command finished provisioning on the provider side.
#[derive(Debug, Clone)]
pub struct ProvisionedProxy {
    pub id: Uuid,
    /// Provider-side identity (instance id, endpoint, session key)
    pub key: String,
    pub name: String,
    /// Partial config; the transport completes it
    pub config: Value,
    /// `Started` for ready endpoints, `Starting` when liveness is unknown
    pub status: ProxyStatus,
}

/// Callback surface offered to a running task command.
///
/// Every call is scoped by the task's capability token: a command can only
/// read and mutate its own connector and that connector's proxies.
pub struct TaskContext {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    task: Task,
    claims: TaskClaims,
}

impl TaskContext {
    /// Verify the task token and open a context for one execution.
    pub fn open(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        tokens: &TaskTokens,
        task: Task,
    ) -> Result<Self> {
        let claims = tokens.verify_for(&task.jwt, &task)?;
        Ok(Self {
            store,
            transport,
            task,
            claims,
        })
    }

    /// Snapshot of the task as it was when the execution started.
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn project_id(&self) -> Uuid {
        self.claims.project_id
    }

    pub fn connector_id(&self) -> Uuid {
        self.claims.connector_id
    }

    pub async fn get_connector(&self) -> Result<Connector> {
        self.store
            .get_connector(self.claims.project_id, self.claims.connector_id)
            .await
    }

    /// Replace the connector config, e.g. to remember a provider resource id.
    pub async fn update_connector_config(&self, config: Value) -> Result<Connector> {
        let mut connector = self.get_connector().await?;
        connector.config = config;
        connector.updated_ts = now_ms();
        self.store.update_connector(&connector).await?;
        Ok(connector)
    }

    pub async fn set_installed(&self, installed: bool) -> Result<()> {
        let mut connector = self.get_connector().await?;
        connector.installed = installed;
        connector.updated_ts = now_ms();
        self.store.update_connector(&connector).await?;
        info!(connector_id = %connector.id, installed, "Connector install state changed");
        Ok(())
    }

    pub async fn list_proxies(&self) -> Result<Vec<Proxy>> {
        self.store
            .list_connector_proxies(self.claims.project_id, self.claims.connector_id)
            .await
    }

    /// Load proxies by id, refusing ids of other connectors.
    pub async fn get_proxies(&self, ids: &[Uuid]) -> Result<Vec<Proxy>> {
        let proxies = self.store.get_proxies(self.claims.project_id, ids).await?;
        if let Some(foreign) = proxies
            .iter()
            .find(|p| p.connector_id != self.claims.connector_id)
        {
            return Err(PoolError::TaskScope(format!("proxy {}", foreign.id)));
        }
        Ok(proxies)
    }

    pub async fn mark_creating(&self, ids: &[Uuid]) -> Result<()> {
        self.mark(ids, ProxyStatus::Creating).await
    }

    pub async fn mark_removing(&self, ids: &[Uuid]) -> Result<()> {
        self.mark(ids, ProxyStatus::Removing).await
    }

    async fn mark(&self, ids: &[Uuid], status: ProxyStatus) -> Result<()> {
        for mut proxy in self.get_proxies(ids).await? {
            if proxy.status != status {
                let expected = proxy.status;
                proxy.transition(status)?;
                self.save(&proxy, expected).await?;
            }
        }
        Ok(())
    }

    /// Persist `proxy` unless it moved away from `expected` meanwhile.
    /// A lost race is retried on the next execution.
    async fn save(&self, proxy: &Proxy, expected: ProxyStatus) -> Result<()> {
        if self.store.update_proxy(proxy, expected).await? {
            return Ok(());
        }
        Err(PoolError::Transient(format!(
            "proxy {} changed status concurrently",
            proxy.id
        )))
    }

    /// Record provider-side keys as soon as resources exist, so a failed or
    /// abandoned task still leaves enough to tear them down.
    pub async fn assign_keys(&self, keys: &[(Uuid, String)]) -> Result<()> {
        let ids: Vec<Uuid> = keys.iter().map(|(id, _)| *id).collect();
        for mut proxy in self.get_proxies(&ids).await? {
            let Some((_, key)) = keys.iter().find(|(id, _)| *id == proxy.id) else {
                continue;
            };
            if proxy.key == *key {
                continue;
            }
            proxy.key = key.clone();
            let expected = proxy.status;
            self.save(&proxy, expected).await?;
        }
        Ok(())
    }

    /// Store provisioned proxies: the transport completes each config, then
    /// the proxy moves to its reported status and becomes due for probing.
    pub async fn report_provisioned(&self, provisioned: Vec<ProvisionedProxy>) -> Result<()> {
        if provisioned.is_empty() {
            return Ok(());
        }
        let connector = self.get_connector().await?;
        let ids: Vec<Uuid> = provisioned.iter().map(|p| p.id).collect();
        let mut existing = self.get_proxies(&ids).await?;
        let now = now_ms();

        for report in provisioned {
            let Some(proxy) = existing.iter_mut().find(|p| p.id == report.id) else {
                return Err(PoolError::ProxyNotFound { id: report.id });
            };
            let expected = proxy.status;
            proxy.key = report.key;
            proxy.name = report.name;
            proxy.config = Some(report.config);
            self.transport.complete_proxy_config(proxy, &connector)?;
            proxy.transition(report.status)?;
            proxy.probe_failures = 0;
            proxy.next_refresh_ts = now;
            self.save(proxy, expected).await?;
            debug!(proxy_id = %proxy.id, status = %proxy.status, "Proxy provisioned");
        }
        Ok(())
    }

    /// Delete proxy records once the provider confirmed teardown.
    pub async fn discard_proxies(&self, ids: &[Uuid]) -> Result<usize> {
        let owned: Vec<Uuid> = self.get_proxies(ids).await?.iter().map(|p| p.id).collect();
        let removed = self
            .store
            .remove_proxies(self.claims.project_id, &owned)
            .await?;
        if removed > 0 {
            info!(connector_id = %self.claims.connector_id, removed, "Proxy records discarded");
        }
        Ok(removed)
    }

    pub async fn list_free_proxies(&self) -> Result<Vec<FreeProxy>> {
        self.store
            .list_free_proxies(self.claims.project_id, self.claims.connector_id)
            .await
    }

    /// Keys already held by proxies of this connector other than `except`.
    pub async fn keys_in_use(&self, except: &[Uuid]) -> Result<HashSet<String>> {
        Ok(self
            .list_proxies()
            .await?
            .into_iter()
            .filter(|p| !except.contains(&p.id) && !p.key.is_empty())
            .map(|p| p.key)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskKind;
    use crate::repository::MemoryStore;
    use crate::transports::DatacenterTransport;
    use serde_json::json;

    async fn setup() -> (Arc<dyn Store>, TaskTokens, Connector, Task) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let tokens = TaskTokens::new("secret");
        let connector = Connector::new(
            Uuid::new_v4(),
            "dc",
            "static-datacenter",
            json!({}),
            json!({}),
            2,
            0,
        );
        store.create_connector(&connector).await.unwrap();

        let mut task = Task::new(
            connector.project_id,
            connector.id,
            TaskKind::CreateProxies,
            2,
            json!({}),
            0,
        );
        task.jwt = tokens.mint(&task).unwrap();
        store.create_task(&task).await.unwrap();
        (store, tokens, connector, task)
    }

    #[tokio::test]
    async fn test_report_provisioned_completes_config() {
        let (store, tokens, connector, task) = setup().await;
        let proxy = Proxy::to_create(connector.project_id, connector.id, "static-datacenter", 0);
        store.create_proxies(&[proxy.clone()]).await.unwrap();

        let ctx = TaskContext::open(store.clone(), Arc::new(DatacenterTransport), &tokens, task)
            .unwrap();
        ctx.mark_creating(&[proxy.id]).await.unwrap();
        ctx.report_provisioned(vec![ProvisionedProxy {
            id: proxy.id,
            key: "10.0.0.1:3128".to_string(),
            name: "10.0.0.1:3128".to_string(),
            config: json!({}),
            status: ProxyStatus::Started,
        }])
        .await
        .unwrap();

        let stored = &store
            .get_proxies(connector.project_id, &[proxy.id])
            .await
            .unwrap()[0];
        assert_eq!(stored.status, ProxyStatus::Started);
        assert_eq!(
            stored.config.as_ref().unwrap()["address"],
            json!("10.0.0.1:3128")
        );
    }

    #[tokio::test]
    async fn test_foreign_proxy_is_out_of_scope() {
        let (store, tokens, connector, task) = setup().await;
        let foreign = Proxy::to_create(connector.project_id, Uuid::new_v4(), "other", 0);
        store.create_proxies(&[foreign.clone()]).await.unwrap();

        let ctx = TaskContext::open(store.clone(), Arc::new(DatacenterTransport), &tokens, task)
            .unwrap();
        let err = ctx.discard_proxies(&[foreign.id]).await.unwrap_err();
        assert!(matches!(err, PoolError::TaskScope(_)));
        assert_eq!(
            store
                .get_proxies(connector.project_id, &[foreign.id])
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_tampered_token_is_rejected() {
        let (store, tokens, _connector, mut task) = setup().await;
        task.jwt = TaskTokens::new("other").mint(&task).unwrap();

        let result = TaskContext::open(store, Arc::new(DatacenterTransport), &tokens, task);
        assert!(matches!(result, Err(PoolError::TaskToken(_))));
    }
}
