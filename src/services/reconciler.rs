//! Pool reconciliation
//!
//! Aligns the live proxy count of every connector with its desired count by
//! emitting at most one create or remove task per connector and cycle. The
//! desired count and the retirement rules come from the connector's project.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::connectors::{Capabilities, ConnectorRegistry, ProxyBatch};
use crate::error::{PoolError, Result};
use crate::models::{now_ms, Connector, Project, Proxy, ProxyStatus, TaskKind};
use crate::repository::Store;
use crate::services::activity::ProjectActivity;
use crate::services::refresh::RefreshJob;
use crate::tasks::TaskScheduler;

pub const MISSING_CERTIFICATE: &str = "Connector requires a certificate";

const DEFAULT_UNREACHABLE_DELAY: Duration = Duration::from_secs(600);

/// Work decided for one connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    Idle,
    /// Create this many `ToCreate` records and one task for them
    Create { count: usize },
    /// One remove task for these proxies
    Remove { proxy_ids: Vec<Uuid> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorPlan {
    /// Status repairs applied before the action
    pub status_changes: Vec<(Uuid, ProxyStatus)>,
    pub action: PlanAction,
    /// Error to record on the connector, `None` clears it
    pub error: Option<String>,
}

/// Project rules a plan is made under.
#[derive(Debug, Clone, Copy)]
pub struct PlanPolicy<'a> {
    pub project: &'a Project,
    pub now: i64,
    /// Milliseconds a proxy may fail every probe before it is retired
    pub unreachable_delay: i64,
}

/// Decide what a connector needs. `None` when a task is already running.
pub fn plan_connector(
    connector: &Connector,
    capabilities: &Capabilities,
    capacity: Option<usize>,
    proxies: &[Proxy],
    task_running: bool,
    policy: &PlanPolicy<'_>,
) -> Option<ConnectorPlan> {
    if task_running {
        return None;
    }

    let project = policy.project;
    let missing_certificate = capabilities.requires_certificate && connector.certificate.is_none();
    let mut desired = if !connector.active || (capabilities.installable && !connector.installed) {
        0
    } else {
        project.desired_size(connector) as usize
    };
    if let Some(capacity) = capacity {
        desired = desired.min(capacity);
    }

    let mut status_changes = Vec::new();
    let mut effective: Vec<(&Proxy, ProxyStatus)> = Vec::with_capacity(proxies.len());
    for proxy in proxies {
        let mut status = match proxy.status {
            // No task owns these any more.
            ProxyStatus::ToCreate | ProxyStatus::Creating => ProxyStatus::Error,
            ProxyStatus::Error => ProxyStatus::ToRemove,
            ProxyStatus::Stopped => ProxyStatus::Starting,
            status => status,
        };
        if status.is_live() && retired(proxy, policy) {
            status = ProxyStatus::ToRemove;
        }
        if status != proxy.status {
            status_changes.push((proxy.id, status));
        }
        effective.push((proxy, status));
    }

    // Removing records without a running task were abandoned mid-removal.
    let flagged: Vec<Uuid> = effective
        .iter()
        .filter(|(_, status)| status.is_removal())
        .map(|(proxy, _)| proxy.id)
        .collect();

    let mut live: Vec<&Proxy> = effective
        .iter()
        .filter(|(_, status)| status.is_live())
        .map(|(proxy, _)| *proxy)
        .collect();

    let action = if !flagged.is_empty() {
        PlanAction::Remove { proxy_ids: flagged }
    } else if live.len() > desired {
        live.sort_by_key(|proxy| (proxy.created_ts, proxy.id));
        let surplus = live.len() - desired;
        PlanAction::Remove {
            proxy_ids: live.iter().take(surplus).map(|proxy| proxy.id).collect(),
        }
    } else if live.len() < desired && !missing_certificate {
        PlanAction::Create {
            count: desired - live.len(),
        }
    } else {
        PlanAction::Idle
    };

    let error = (missing_certificate && connector.active).then(|| MISSING_CERTIFICATE.to_string());

    Some(ConnectorPlan {
        status_changes,
        action,
        error,
    })
}

/// Unreachable for too long, or older than its rotation age.
fn retired(proxy: &Proxy, policy: &PlanPolicy<'_>) -> bool {
    if proxy.unreachable_for(policy.unreachable_delay, policy.now) {
        return true;
    }
    let project = policy.project;
    project.rotates()
        && policy.now - proxy.created_ts > proxy.rotation_age(&project.auto_rotate_delay_range)
}

/// Applies [`plan_connector`] to every connector.
pub struct Reconciler {
    store: Arc<dyn Store>,
    connectors: ConnectorRegistry,
    scheduler: Arc<TaskScheduler>,
    unreachable_delay: Duration,
    activity: Option<ProjectActivity>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        connectors: ConnectorRegistry,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        Self {
            store,
            connectors,
            scheduler,
            unreachable_delay: DEFAULT_UNREACHABLE_DELAY,
            activity: None,
        }
    }

    pub fn with_unreachable_delay(mut self, delay: Duration) -> Self {
        self.unreachable_delay = delay;
        self
    }

    /// Feed relay traffic into auto scale up and down
    pub fn with_activity(mut self, activity: ProjectActivity) -> Self {
        self.activity = Some(activity);
        self
    }

    /// One reconciliation pass over every connector.
    #[instrument(skip(self))]
    pub async fn reconcile_all(&self) -> Result<usize> {
        let mut by_project: HashMap<Uuid, Vec<Connector>> = HashMap::new();
        for connector in self.store.list_all_connectors().await? {
            by_project
                .entry(connector.project_id)
                .or_default()
                .push(connector);
        }

        let mut submitted = 0;
        for (project_id, connectors) in by_project {
            let project = match self.project_policy(project_id).await {
                Ok(project) => project,
                Err(e) => {
                    warn!(project_id = %project_id, "Loading project failed: {}", e);
                    continue;
                }
            };
            for connector in connectors {
                match self.reconcile_under(&connector, &project).await {
                    Ok(true) => submitted += 1,
                    Ok(false) => {}
                    Err(e) => warn!(connector_id = %connector.id, "Reconciliation failed: {}", e),
                }
            }
        }
        Ok(submitted)
    }

    /// Reconcile one connector. Returns whether a task was submitted.
    pub async fn reconcile(&self, connector: &Connector) -> Result<bool> {
        let project = self.project_policy(connector.project_id).await?;
        self.reconcile_under(connector, &project).await
    }

    /// The stored project with pending traffic and idle scale down applied.
    /// Projects without settings are always hot.
    async fn project_policy(&self, project_id: Uuid) -> Result<Project> {
        let pending = self
            .activity
            .as_ref()
            .and_then(|activity| activity.take(project_id));
        let Some(mut project) = self.store.get_project(project_id).await? else {
            return Ok(Project::unmanaged(project_id));
        };

        let before = project.status;
        let mut changed = pending.is_some_and(|ts| project.record_data(ts));
        changed |= project.scale_down_if_idle(now_ms());
        if project.status != before {
            info!(
                project_id = %project_id,
                from = %before,
                to = %project.status,
                "Project status changed"
            );
        }
        if changed {
            self.store.save_project(&project).await?;
        }
        Ok(project)
    }

    async fn reconcile_under(&self, connector: &Connector, project: &Project) -> Result<bool> {
        let provider = self.connectors.get(&connector.provider)?;
        let running = self
            .store
            .find_running_task(connector.project_id, connector.id)
            .await?
            .is_some();
        let proxies = self
            .store
            .list_connector_proxies(connector.project_id, connector.id)
            .await?;

        let policy = PlanPolicy {
            project,
            now: now_ms(),
            unreachable_delay: self.unreachable_delay.as_millis() as i64,
        };
        let Some(plan) = plan_connector(
            connector,
            &provider.capabilities(),
            provider.capacity(connector),
            &proxies,
            running,
            &policy,
        ) else {
            debug!(connector_id = %connector.id, "Task in flight, skipping");
            return Ok(false);
        };

        if plan.error != connector.error {
            let mut updated = connector.clone();
            updated.error = plan.error.clone();
            updated.updated_ts = now_ms();
            self.store.update_connector(&updated).await?;
            if let Some(error) = &plan.error {
                warn!(connector_id = %connector.id, "{}", error);
            }
        }

        let mut by_id: HashMap<Uuid, Proxy> = proxies.into_iter().map(|p| (p.id, p)).collect();
        for (id, status) in &plan.status_changes {
            if let Some(proxy) = by_id.get_mut(id) {
                debug!(proxy_id = %id, from = %proxy.status, to = %status, "Repairing proxy status");
                if !self.move_proxy(proxy, *status).await? {
                    return Ok(false);
                }
            }
        }

        match plan.action {
            PlanAction::Idle => Ok(false),
            PlanAction::Create { count } => {
                self.create(connector, provider.provider_type(), count)
                    .await
            }
            PlanAction::Remove { proxy_ids } => {
                for id in &proxy_ids {
                    if let Some(proxy) = by_id.get_mut(id) {
                        if !proxy.status.is_removal()
                            && !self.move_proxy(proxy, ProxyStatus::ToRemove).await?
                        {
                            return Ok(false);
                        }
                    }
                }
                self.submit(connector, TaskKind::RemoveProxies, proxy_ids)
                    .await
            }
        }
    }

    /// Transition and store `proxy`. `false` when another writer changed it
    /// first; the plan is stale and the next cycle starts over.
    async fn move_proxy(&self, proxy: &mut Proxy, status: ProxyStatus) -> Result<bool> {
        let expected = proxy.status;
        proxy.transition(status)?;
        let stored = self.store.update_proxy(proxy, expected).await?;
        if !stored {
            debug!(proxy_id = %proxy.id, "Proxy changed concurrently, plan dropped");
        }
        Ok(stored)
    }

    async fn create(&self, connector: &Connector, provider_type: &str, count: usize) -> Result<bool> {
        let now = now_ms();
        let records: Vec<Proxy> = (0..count)
            .map(|_| Proxy::to_create(connector.project_id, connector.id, provider_type, now))
            .collect();
        let ids: Vec<Uuid> = records.iter().map(|p| p.id).collect();
        self.store.create_proxies(&records).await?;

        let submitted = self
            .submit(connector, TaskKind::CreateProxies, ids.clone())
            .await;
        if !matches!(submitted, Ok(true)) {
            self.store
                .remove_proxies(connector.project_id, &ids)
                .await?;
        }
        submitted
    }

    async fn submit(&self, connector: &Connector, kind: TaskKind, proxy_ids: Vec<Uuid>) -> Result<bool> {
        let count = proxy_ids.len();
        let data = ProxyBatch::new(proxy_ids).to_value()?;
        match self.scheduler.submit(connector, kind, data).await {
            Ok(task) => {
                info!(
                    connector_id = %connector.id,
                    task_id = %task.id,
                    kind = %kind,
                    count,
                    "Reconciliation task submitted"
                );
                Ok(true)
            }
            // Another instance won the race; the next cycle sees its task.
            Err(PoolError::TaskAlreadyRunning { .. }) => {
                debug!(connector_id = %connector.id, kind = %kind, "Task already running");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RefreshJob for Reconciler {
    fn name(&self) -> &'static str {
        "connectors"
    }

    async fn refresh(&self) -> Result<()> {
        self.reconcile_all().await.map(|_| ())
    }
}
