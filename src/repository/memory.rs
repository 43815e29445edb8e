use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{Store, PROBED_STATUSES};
use crate::error::{PoolError, Result};
use crate::models::{Connector, FreeProxy, Project, Proxy, ProxyStatus, Task, TaskUpdate};

#[derive(Default)]
struct Tables {
    projects: HashMap<Uuid, Project>,
    connectors: HashMap<Uuid, Connector>,
    proxies: HashMap<Uuid, Proxy>,
    tasks: HashMap<Uuid, Task>,
    free_proxies: HashMap<Uuid, FreeProxy>,
}

impl Tables {
    fn task_mut(&mut self, project_id: Uuid, task_id: Uuid) -> Result<&mut Task> {
        self.tasks
            .get_mut(&task_id)
            .filter(|task| task.project_id == project_id)
            .ok_or(PoolError::TaskNotFound { id: task_id })
    }
}

/// Single-process store. Every operation holds the table lock for its whole
/// duration, which makes `lock_task` a compare-and-swap.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_created<T, F: Fn(&T) -> i64>(mut items: Vec<T>, key: F) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>> {
        Ok(self.tables.read().projects.get(&project_id).cloned())
    }

    async fn save_project(&self, project: &Project) -> Result<()> {
        self.tables
            .write()
            .projects
            .insert(project.id, project.clone());
        Ok(())
    }

    async fn create_connector(&self, connector: &Connector) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.connectors.contains_key(&connector.id) {
            return Err(PoolError::Conflict(format!(
                "connector {} already exists",
                connector.id
            )));
        }
        tables.connectors.insert(connector.id, connector.clone());
        Ok(())
    }

    async fn update_connector(&self, connector: &Connector) -> Result<()> {
        let mut tables = self.tables.write();
        match tables.connectors.get_mut(&connector.id) {
            Some(existing) if existing.project_id == connector.project_id => {
                *existing = connector.clone();
                Ok(())
            }
            _ => Err(PoolError::ConnectorNotFound { id: connector.id }),
        }
    }

    async fn remove_connector(&self, project_id: Uuid, connector_id: Uuid) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables
            .connectors
            .get(&connector_id)
            .is_some_and(|c| c.project_id == project_id)
        {
            return Err(PoolError::ConnectorNotFound { id: connector_id });
        }
        if tables
            .proxies
            .values()
            .any(|p| p.connector_id == connector_id)
        {
            return Err(PoolError::Conflict(format!(
                "connector {} still has proxies",
                connector_id
            )));
        }
        if tables
            .tasks
            .values()
            .any(|t| t.connector_id == connector_id && t.running)
        {
            return Err(PoolError::Conflict(format!(
                "connector {} has a running task",
                connector_id
            )));
        }

        tables.connectors.remove(&connector_id);
        tables.tasks.retain(|_, t| t.connector_id != connector_id);
        tables
            .free_proxies
            .retain(|_, f| f.connector_id != connector_id);
        Ok(())
    }

    async fn get_connector(&self, project_id: Uuid, connector_id: Uuid) -> Result<Connector> {
        self.tables
            .read()
            .connectors
            .get(&connector_id)
            .filter(|c| c.project_id == project_id)
            .cloned()
            .ok_or(PoolError::ConnectorNotFound { id: connector_id })
    }

    async fn list_connectors(&self, project_id: Uuid) -> Result<Vec<Connector>> {
        let connectors = self
            .tables
            .read()
            .connectors
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect();
        Ok(sorted_by_created(connectors, |c: &Connector| c.created_ts))
    }

    async fn list_all_connectors(&self) -> Result<Vec<Connector>> {
        let connectors = self.tables.read().connectors.values().cloned().collect();
        Ok(sorted_by_created(connectors, |c: &Connector| c.created_ts))
    }

    async fn create_proxies(&self, proxies: &[Proxy]) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(existing) = proxies.iter().find(|p| tables.proxies.contains_key(&p.id)) {
            return Err(PoolError::Conflict(format!(
                "proxy {} already exists",
                existing.id
            )));
        }
        for proxy in proxies {
            tables.proxies.insert(proxy.id, proxy.clone());
        }
        Ok(())
    }

    async fn update_proxy(&self, proxy: &Proxy, expected: ProxyStatus) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.proxies.get_mut(&proxy.id) {
            Some(existing) if existing.project_id == proxy.project_id => {
                if existing.status != expected {
                    return Ok(false);
                }
                *existing = proxy.clone();
                Ok(true)
            }
            _ => Err(PoolError::ProxyNotFound { id: proxy.id }),
        }
    }

    async fn remove_proxies(&self, project_id: Uuid, ids: &[Uuid]) -> Result<usize> {
        let mut tables = self.tables.write();
        let mut removed = 0;
        for id in ids {
            if tables
                .proxies
                .get(id)
                .is_some_and(|p| p.project_id == project_id)
            {
                tables.proxies.remove(id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn get_proxies(&self, project_id: Uuid, ids: &[Uuid]) -> Result<Vec<Proxy>> {
        let tables = self.tables.read();
        Ok(ids
            .iter()
            .filter_map(|id| tables.proxies.get(id))
            .filter(|p| p.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn list_connector_proxies(
        &self,
        project_id: Uuid,
        connector_id: Uuid,
    ) -> Result<Vec<Proxy>> {
        let proxies = self
            .tables
            .read()
            .proxies
            .values()
            .filter(|p| p.project_id == project_id && p.connector_id == connector_id)
            .cloned()
            .collect();
        Ok(sorted_by_created(proxies, |p: &Proxy| p.created_ts))
    }

    async fn list_proxies_by_status(&self, statuses: &[ProxyStatus]) -> Result<Vec<Proxy>> {
        let proxies = self
            .tables
            .read()
            .proxies
            .values()
            .filter(|p| statuses.contains(&p.status))
            .cloned()
            .collect();
        Ok(sorted_by_created(proxies, |p: &Proxy| p.created_ts))
    }

    async fn claim_proxies_to_refresh(
        &self,
        now: i64,
        claim_until: i64,
        limit: usize,
    ) -> Result<Vec<Proxy>> {
        let mut tables = self.tables.write();
        let mut due: Vec<&mut Proxy> = tables
            .proxies
            .values_mut()
            .filter(|p| PROBED_STATUSES.contains(&p.status) && p.next_refresh_ts <= now)
            .collect();
        due.sort_by_key(|p| p.next_refresh_ts);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|proxy| {
                proxy.next_refresh_ts = claim_until;
                proxy.clone()
            })
            .collect())
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut tables = self.tables.write();
        if task.running
            && tables
                .tasks
                .values()
                .any(|t| t.connector_id == task.connector_id && t.running)
        {
            return Err(PoolError::TaskAlreadyRunning {
                connector_id: task.connector_id,
            });
        }
        tables.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, project_id: Uuid, task_id: Uuid) -> Result<Task> {
        self.tables
            .read()
            .tasks
            .get(&task_id)
            .filter(|t| t.project_id == project_id)
            .cloned()
            .ok_or(PoolError::TaskNotFound { id: task_id })
    }

    async fn list_tasks(&self, project_id: Uuid) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tables
            .read()
            .tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| std::cmp::Reverse(t.start_at_ts));
        Ok(tasks)
    }

    async fn list_running_tasks(&self) -> Result<Vec<Task>> {
        Ok(self
            .tables
            .read()
            .tasks
            .values()
            .filter(|t| t.running)
            .cloned()
            .collect())
    }

    async fn find_running_task(
        &self,
        project_id: Uuid,
        connector_id: Uuid,
    ) -> Result<Option<Task>> {
        Ok(self
            .tables
            .read()
            .tasks
            .values()
            .find(|t| t.project_id == project_id && t.connector_id == connector_id && t.running)
            .cloned())
    }

    async fn next_task_to_run(&self, now: i64) -> Result<Option<Task>> {
        Ok(self
            .tables
            .read()
            .tasks
            .values()
            .filter(|t| t.is_due(now))
            .min_by_key(|t| t.next_retry_ts)
            .cloned())
    }

    async fn lock_task(&self, project_id: Uuid, task_id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write();
        let (connector_id, available) = {
            let task = tables.task_mut(project_id, task_id)?;
            (task.connector_id, task.running && !task.locked)
        };
        if !available {
            return Ok(false);
        }
        if tables
            .tasks
            .values()
            .any(|t| t.connector_id == connector_id && t.locked)
        {
            return Ok(false);
        }

        tables.task_mut(project_id, task_id)?.locked = true;
        Ok(true)
    }

    async fn update_task(
        &self,
        project_id: Uuid,
        task_id: Uuid,
        update: TaskUpdate,
        now: i64,
    ) -> Result<Task> {
        let mut tables = self.tables.write();
        let task = tables.task_mut(project_id, task_id)?;
        let mut updated = task.clone();
        updated.apply_update(update, now)?;
        updated.locked = false;
        *task = updated.clone();
        Ok(updated)
    }

    async fn release_task(&self, project_id: Uuid, task_id: Uuid) -> Result<()> {
        self.tables.write().task_mut(project_id, task_id)?.locked = false;
        Ok(())
    }

    async fn cancel_task(&self, project_id: Uuid, task_id: Uuid, now: i64) -> Result<Task> {
        let mut tables = self.tables.write();
        let task = tables.task_mut(project_id, task_id)?;
        if !task.running {
            return Err(PoolError::TaskNotRunning { id: task_id });
        }
        task.cancelled = true;
        task.next_retry_ts = task.next_retry_ts.min(now);
        Ok(task.clone())
    }

    async fn sync_free_proxies(
        &self,
        project_id: Uuid,
        connector_id: Uuid,
        keys: &[String],
        now: i64,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();

        tables
            .free_proxies
            .retain(|_, f| f.connector_id != connector_id || wanted.contains(f.key.as_str()));

        let existing: HashSet<String> = tables
            .free_proxies
            .values()
            .filter(|f| f.connector_id == connector_id)
            .map(|f| f.key.clone())
            .collect();
        for key in keys {
            if !existing.contains(key) {
                let free_proxy = FreeProxy::new(project_id, connector_id, key.clone(), now);
                tables.free_proxies.insert(free_proxy.id, free_proxy);
            }
        }
        Ok(())
    }

    async fn update_free_proxy(&self, free_proxy: &FreeProxy) -> Result<()> {
        let mut tables = self.tables.write();
        // Silently skipped when the record was synced away during the probe.
        if let Some(existing) = tables.free_proxies.get_mut(&free_proxy.id) {
            *existing = free_proxy.clone();
        }
        Ok(())
    }

    async fn list_free_proxies(
        &self,
        project_id: Uuid,
        connector_id: Uuid,
    ) -> Result<Vec<FreeProxy>> {
        let mut free_proxies: Vec<FreeProxy> = self
            .tables
            .read()
            .free_proxies
            .values()
            .filter(|f| f.project_id == project_id && f.connector_id == connector_id)
            .cloned()
            .collect();
        free_proxies.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(free_proxies)
    }

    async fn claim_free_proxies_to_refresh(
        &self,
        now: i64,
        claim_until: i64,
        limit: usize,
    ) -> Result<Vec<FreeProxy>> {
        let mut tables = self.tables.write();
        let mut due: Vec<&mut FreeProxy> = tables
            .free_proxies
            .values_mut()
            .filter(|f| f.next_refresh_ts <= now)
            .collect();
        due.sort_by_key(|f| f.next_refresh_ts);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|free_proxy| {
                free_proxy.next_refresh_ts = claim_until;
                free_proxy.clone()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskKind;
    use serde_json::json;

    fn connector() -> Connector {
        Connector::new(Uuid::new_v4(), "c", "static-datacenter", json!({}), json!({}), 3, 0)
    }

    fn task(connector: &Connector) -> Task {
        Task::new(
            connector.project_id,
            connector.id,
            TaskKind::CreateProxies,
            2,
            json!({}),
            0,
        )
    }

    #[tokio::test]
    async fn test_second_running_task_is_rejected() {
        let store = MemoryStore::new();
        let connector = connector();
        store.create_task(&task(&connector)).await.unwrap();

        let err = store.create_task(&task(&connector)).await.unwrap_err();
        assert!(matches!(err, PoolError::TaskAlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_per_connector() {
        let store = MemoryStore::new();
        let connector = connector();
        let first = task(&connector);
        let mut second = task(&connector);
        second.running = false;
        store.create_task(&first).await.unwrap();
        store.create_task(&second).await.unwrap();

        assert!(store.lock_task(first.project_id, first.id).await.unwrap());
        assert!(!store.lock_task(first.project_id, first.id).await.unwrap());
        // A finished task of the same connector can never be locked.
        assert!(!store.lock_task(second.project_id, second.id).await.unwrap());

        store.release_task(first.project_id, first.id).await.unwrap();
        assert!(store.lock_task(first.project_id, first.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_unlocks_and_rejects_after_termination() {
        let store = MemoryStore::new();
        let connector = connector();
        let task = task(&connector);
        store.create_task(&task).await.unwrap();
        assert!(store.lock_task(task.project_id, task.id).await.unwrap());

        let done = store
            .update_task(task.project_id, task.id, TaskUpdate::finish(&task, "", json!({})), 10)
            .await
            .unwrap();
        assert!(!done.locked);
        assert!(!done.running);
        assert_eq!(done.message, "Task completed");

        let err = store
            .update_task(task.project_id, task.id, TaskUpdate::wait(&task, "", json!({})), 11)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::TaskNotRunning { .. }));
    }

    #[tokio::test]
    async fn test_claim_pushes_next_refresh() {
        let store = MemoryStore::new();
        let connector = connector();
        let mut started = Proxy::to_create(connector.project_id, connector.id, "p", 0);
        started.status = ProxyStatus::Started;
        started.config = Some(json!({}));
        let mut creating = Proxy::to_create(connector.project_id, connector.id, "p", 0);
        creating.status = ProxyStatus::Creating;
        store
            .create_proxies(&[started.clone(), creating])
            .await
            .unwrap();

        let claimed = store.claim_proxies_to_refresh(100, 5_000, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, started.id);
        assert!(store
            .claim_proxies_to_refresh(100, 5_000, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_sync_free_proxies_keeps_probe_state() {
        let store = MemoryStore::new();
        let connector = connector();
        let keys = vec!["http://a:1".to_string(), "http://b:2".to_string()];
        store
            .sync_free_proxies(connector.project_id, connector.id, &keys, 0)
            .await
            .unwrap();

        let mut first = store
            .list_free_proxies(connector.project_id, connector.id)
            .await
            .unwrap()
            .remove(0);
        first.fingerprint = Some(crate::models::Fingerprint::synthetic("x"));
        store.update_free_proxy(&first).await.unwrap();

        store
            .sync_free_proxies(connector.project_id, connector.id, &keys[..1], 0)
            .await
            .unwrap();
        let remaining = store
            .list_free_proxies(connector.project_id, connector.id)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].is_online());
    }

    #[tokio::test]
    async fn test_remove_connector_with_proxies_conflicts() {
        let store = MemoryStore::new();
        let connector = connector();
        store.create_connector(&connector).await.unwrap();
        store
            .create_proxies(&[Proxy::to_create(connector.project_id, connector.id, "p", 0)])
            .await
            .unwrap();

        let err = store
            .remove_connector(connector.project_id, connector.id)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_proxy_requires_expected_status() {
        let store = MemoryStore::new();
        let connector = connector();
        store.create_connector(&connector).await.unwrap();
        let mut proxy = Proxy::to_create(connector.project_id, connector.id, "p", 0);
        proxy.status = ProxyStatus::Started;
        store.create_proxies(&[proxy.clone()]).await.unwrap();

        let mut removing = proxy.clone();
        removing.status = ProxyStatus::Removing;
        assert!(store
            .update_proxy(&removing, ProxyStatus::Started)
            .await
            .unwrap());

        // A stale writer still believing the proxy is Started loses.
        proxy.probe_failures = 1;
        assert!(!store
            .update_proxy(&proxy, ProxyStatus::Started)
            .await
            .unwrap());
        let stored = store
            .get_proxies(connector.project_id, &[proxy.id])
            .await
            .unwrap()
            .remove(0);
        assert_eq!(stored.status, ProxyStatus::Removing);
        assert_eq!(stored.probe_failures, 0);

        let missing = Proxy::to_create(connector.project_id, connector.id, "p", 0);
        let err = store
            .update_proxy(&missing, ProxyStatus::ToCreate)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::ProxyNotFound { .. }));
    }
}
