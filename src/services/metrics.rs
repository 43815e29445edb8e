//! Pool metrics
//!
//! A periodic snapshot of proxy counts per status and connector plus running
//! tasks, published lock-free for the API.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{now_ms, ProxyStatus, TaskKind};
use crate::proxy::selector::ProxySelector;
use crate::repository::Store;
use crate::services::refresh::RefreshJob;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorMetrics {
    pub connector_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub provider: String,
    pub active: bool,
    pub proxies_max: u32,
    pub proxies: BTreeMap<ProxyStatus, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_task: Option<TaskKind>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub generated_ts: i64,
    pub connectors: Vec<ConnectorMetrics>,
    pub proxies: BTreeMap<ProxyStatus, usize>,
    pub running_tasks: usize,
    /// Proxies the relay currently selects from
    pub relay_proxies: usize,
    pub relay_in_flight: usize,
}

impl MetricsSnapshot {
    pub fn total_proxies(&self) -> usize {
        self.proxies.values().sum()
    }
}

pub struct MetricsCollector {
    store: Arc<dyn Store>,
    selector: Option<Arc<dyn ProxySelector>>,
    snapshot: ArcSwap<MetricsSnapshot>,
}

impl MetricsCollector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            selector: None,
            snapshot: ArcSwap::from_pointee(MetricsSnapshot::default()),
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<MetricsSnapshot> {
        self.snapshot.load_full()
    }

    /// Build a fresh snapshot from the store and publish it.
    pub async fn collect(&self) -> Result<Arc<MetricsSnapshot>> {
        let connectors = self.store.list_all_connectors().await?;
        let proxies = self.store.list_proxies_by_status(&ProxyStatus::ALL).await?;
        let tasks = self.store.list_running_tasks().await?;

        let mut per_connector: BTreeMap<Uuid, ConnectorMetrics> = connectors
            .into_iter()
            .map(|c| {
                (
                    c.id,
                    ConnectorMetrics {
                        connector_id: c.id,
                        project_id: c.project_id,
                        name: c.name,
                        provider: c.provider,
                        active: c.active,
                        proxies_max: c.proxies_max,
                        ..ConnectorMetrics::default()
                    },
                )
            })
            .collect();

        let mut totals = BTreeMap::new();
        for proxy in &proxies {
            *totals.entry(proxy.status).or_insert(0) += 1;
            if let Some(metrics) = per_connector.get_mut(&proxy.connector_id) {
                *metrics.proxies.entry(proxy.status).or_insert(0) += 1;
            }
        }
        for task in &tasks {
            if let Some(metrics) = per_connector.get_mut(&task.connector_id) {
                metrics.running_task = Some(task.kind);
            }
        }

        let snapshot = Arc::new(MetricsSnapshot {
            generated_ts: now_ms(),
            connectors: per_connector.into_values().collect(),
            proxies: totals,
            running_tasks: tasks.len(),
            relay_proxies: self.selector.as_ref().map_or(0, |s| s.available_count()),
            relay_in_flight: self.selector.as_ref().map_or(0, |s| s.in_flight()),
        });
        self.snapshot.store(snapshot.clone());
        Ok(snapshot)
    }
}

#[async_trait]
impl RefreshJob for MetricsCollector {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn refresh(&self) -> Result<()> {
        let snapshot = self.collect().await?;
        info!(
            connectors = snapshot.connectors.len(),
            proxies = snapshot.total_proxies(),
            started = snapshot.proxies.get(&ProxyStatus::Started).copied().unwrap_or(0),
            running_tasks = snapshot.running_tasks,
            relay_in_flight = snapshot.relay_in_flight,
            "Metrics refreshed"
        );
        Ok(())
    }
}
