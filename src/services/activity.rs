//! Relay traffic per project
//!
//! The relay records the last time a project's proxies carried data; the
//! reconciler drains it into the stored projects for auto scale up/down.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

/// Latest relay timestamp per project, shared by relay and reconciler.
#[derive(Debug, Clone, Default)]
pub struct ProjectActivity {
    last_data: Arc<DashMap<Uuid, i64>>,
}

impl ProjectActivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the newest of the stored and the given timestamp.
    pub fn record(&self, project_id: Uuid, ts: i64) {
        self.last_data
            .entry(project_id)
            .and_modify(|last| *last = (*last).max(ts))
            .or_insert(ts);
    }

    /// Remove and return the pending timestamp of a project.
    pub fn take(&self, project_id: Uuid) -> Option<i64> {
        self.last_data.remove(&project_id).map(|(_, ts)| ts)
    }

    pub fn len(&self) -> usize {
        self.last_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_data.is_empty()
    }
}
