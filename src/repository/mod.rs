//! Persisted store shared by every orchestrator instance.
//!
//! The task lock is the only mutual exclusion primitive: `lock_task` is a
//! compare-and-swap that succeeds for at most one task per connector.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Connector, FreeProxy, Project, Proxy, ProxyStatus, Task, TaskUpdate};

#[async_trait]
pub trait Store: Send + Sync {
    // Projects

    /// `None` when the project never stored settings.
    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>>;

    /// Insert or replace project settings.
    async fn save_project(&self, project: &Project) -> Result<()>;

    // Connectors

    async fn create_connector(&self, connector: &Connector) -> Result<()>;

    async fn update_connector(&self, connector: &Connector) -> Result<()>;

    /// Fails with `Conflict` while proxies or a running task remain.
    async fn remove_connector(&self, project_id: Uuid, connector_id: Uuid) -> Result<()>;

    async fn get_connector(&self, project_id: Uuid, connector_id: Uuid) -> Result<Connector>;

    async fn list_connectors(&self, project_id: Uuid) -> Result<Vec<Connector>>;

    /// Every connector of every project, for the reconciliation loop.
    async fn list_all_connectors(&self) -> Result<Vec<Connector>>;

    // Proxies

    async fn create_proxies(&self, proxies: &[Proxy]) -> Result<()>;

    /// Overwrite a record only while its stored status is still `expected`.
    /// Returns `false` when another writer moved the proxy first.
    async fn update_proxy(&self, proxy: &Proxy, expected: ProxyStatus) -> Result<bool>;

    /// Delete records. Returns how many existed.
    async fn remove_proxies(&self, project_id: Uuid, ids: &[Uuid]) -> Result<usize>;

    async fn get_proxies(&self, project_id: Uuid, ids: &[Uuid]) -> Result<Vec<Proxy>>;

    async fn list_connector_proxies(
        &self,
        project_id: Uuid,
        connector_id: Uuid,
    ) -> Result<Vec<Proxy>>;

    async fn list_proxies_by_status(&self, statuses: &[ProxyStatus]) -> Result<Vec<Proxy>>;

    /// Claim up to `limit` probe-able proxies whose `next_refresh_ts` has
    /// elapsed, pushing it to `claim_until` so other instances skip them.
    async fn claim_proxies_to_refresh(
        &self,
        now: i64,
        claim_until: i64,
        limit: usize,
    ) -> Result<Vec<Proxy>>;

    // Tasks

    /// Fails with `TaskAlreadyRunning` if the connector has a running task.
    async fn create_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, project_id: Uuid, task_id: Uuid) -> Result<Task>;

    async fn list_tasks(&self, project_id: Uuid) -> Result<Vec<Task>>;

    async fn list_running_tasks(&self) -> Result<Vec<Task>>;

    async fn find_running_task(
        &self,
        project_id: Uuid,
        connector_id: Uuid,
    ) -> Result<Option<Task>>;

    /// Running, unlocked task with the earliest elapsed `next_retry_ts`.
    async fn next_task_to_run(&self, now: i64) -> Result<Option<Task>>;

    /// Acquire the execution lock. `false` means contention, never an error.
    async fn lock_task(&self, project_id: Uuid, task_id: Uuid) -> Result<bool>;

    /// Apply `update` and release the lock in one write.
    async fn update_task(
        &self,
        project_id: Uuid,
        task_id: Uuid,
        update: TaskUpdate,
        now: i64,
    ) -> Result<Task>;

    async fn release_task(&self, project_id: Uuid, task_id: Uuid) -> Result<()>;

    /// Flag a running task as cancelled and make it due immediately.
    async fn cancel_task(&self, project_id: Uuid, task_id: Uuid, now: i64) -> Result<Task>;

    // Free proxies

    /// Make the connector's free proxy records match `keys`, keeping the
    /// probe state of records that survive.
    async fn sync_free_proxies(
        &self,
        project_id: Uuid,
        connector_id: Uuid,
        keys: &[String],
        now: i64,
    ) -> Result<()>;

    async fn update_free_proxy(&self, free_proxy: &FreeProxy) -> Result<()>;

    async fn list_free_proxies(
        &self,
        project_id: Uuid,
        connector_id: Uuid,
    ) -> Result<Vec<FreeProxy>>;

    async fn claim_free_proxies_to_refresh(
        &self,
        now: i64,
        claim_until: i64,
        limit: usize,
    ) -> Result<Vec<FreeProxy>>;
}

/// Statuses the liveness probe visits.
pub const PROBED_STATUSES: [ProxyStatus; 2] = [ProxyStatus::Starting, ProxyStatus::Started];
