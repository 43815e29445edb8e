use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Fingerprint;

/// Candidate endpoint of a list-backed connector, probed before allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeProxy {
    pub id: Uuid,
    pub project_id: Uuid,
    pub connector_id: Uuid,
    /// Proxy URL as configured by the user
    pub key: String,
    pub fingerprint: Option<Fingerprint>,
    pub fingerprint_error: Option<String>,
    pub next_refresh_ts: i64,
}

impl FreeProxy {
    pub fn new(project_id: Uuid, connector_id: Uuid, key: impl Into<String>, now: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            connector_id,
            key: key.into(),
            fingerprint: None,
            fingerprint_error: None,
            next_refresh_ts: now,
        }
    }

    pub fn is_online(&self) -> bool {
        self.fingerprint.is_some() && self.fingerprint_error.is_none()
    }
}
