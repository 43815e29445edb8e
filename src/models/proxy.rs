use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{DelayRange, Fingerprint};
use crate::error::{PoolError, Result};

/// Lifecycle status of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyStatus {
    ToCreate,
    Creating,
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Error,
    ToRemove,
    Removing,
}

impl ProxyStatus {
    pub const ALL: [ProxyStatus; 10] = [
        ProxyStatus::ToCreate,
        ProxyStatus::Creating,
        ProxyStatus::Created,
        ProxyStatus::Starting,
        ProxyStatus::Started,
        ProxyStatus::Stopping,
        ProxyStatus::Stopped,
        ProxyStatus::Error,
        ProxyStatus::ToRemove,
        ProxyStatus::Removing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::ToCreate => "to-create",
            ProxyStatus::Creating => "creating",
            ProxyStatus::Created => "created",
            ProxyStatus::Starting => "starting",
            ProxyStatus::Started => "started",
            ProxyStatus::Stopping => "stopping",
            ProxyStatus::Stopped => "stopped",
            ProxyStatus::Error => "error",
            ProxyStatus::ToRemove => "to-remove",
            ProxyStatus::Removing => "removing",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Statuses counted as capacity by the reconciliation loop.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ProxyStatus::Created | ProxyStatus::Starting | ProxyStatus::Started
        )
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, ProxyStatus::ToRemove | ProxyStatus::Removing)
    }

    /// Edges of the lifecycle graph. Staying in place is always allowed.
    pub fn can_transition_to(&self, to: ProxyStatus) -> bool {
        use ProxyStatus::*;

        if *self == to {
            return true;
        }

        match (self, to) {
            (Removing, _) => false,
            (_, ToRemove) => true,
            (ToRemove, Removing) => true,
            (ToRemove, _) => false,
            (_, Error) => true,
            (ToCreate, Creating) => true,
            (Creating, Created | Starting | Started) => true,
            (Created, Starting | Started) => true,
            (Starting, Started | Stopping) => true,
            (Started, Stopping) => true,
            (Stopping, Stopped) => true,
            (Stopped, Starting) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Proxy entity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proxy {
    pub id: Uuid,
    pub project_id: Uuid,
    pub connector_id: Uuid,
    /// Connector type that owns this proxy
    pub provider: String,
    /// Provider-side identifier (instance id, session, endpoint)
    pub key: String,
    pub name: String,
    pub status: ProxyStatus,
    /// Transport-specific configuration, only read by the transport
    pub config: Option<Value>,
    pub fingerprint: Option<Fingerprint>,
    pub fingerprint_error: Option<String>,
    pub probe_failures: u32,
    pub replaced: bool,
    /// Position of this proxy inside the project's auto-rotate delay range, in `[0, 1)`
    pub auto_rotate_delay_factor: f64,
    /// First failed probe of the current failure streak
    pub disconnected_ts: Option<i64>,
    pub created_ts: i64,
    pub next_refresh_ts: i64,
}

impl Proxy {
    /// New record awaiting provisioning.
    pub fn to_create(project_id: Uuid, connector_id: Uuid, provider: &str, now: i64) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            project_id,
            connector_id,
            provider: provider.to_string(),
            key: String::new(),
            name: format!("{}-{}", provider, &id.simple().to_string()[..8]),
            status: ProxyStatus::ToCreate,
            config: None,
            fingerprint: None,
            fingerprint_error: None,
            probe_failures: 0,
            replaced: false,
            auto_rotate_delay_factor: rand::random(),
            disconnected_ts: None,
            created_ts: now,
            next_refresh_ts: now,
        }
    }

    /// Age after which auto-rotate retires this proxy, within `range`.
    pub fn rotation_age(&self, range: &DelayRange) -> i64 {
        let spread = (range.max - range.min).max(0) as f64;
        range.min + (spread * self.auto_rotate_delay_factor) as i64
    }

    /// Whether the proxy has been unreachable for longer than `delay` ms.
    pub fn unreachable_for(&self, delay: i64, now: i64) -> bool {
        self.disconnected_ts
            .is_some_and(|since| now - since > delay)
    }

    pub fn transition(&mut self, to: ProxyStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(PoolError::InvalidStatusTransition {
                id: self.id,
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        if to == ProxyStatus::Started && self.config.is_none() {
            return Err(PoolError::Validation(format!(
                "proxy {} cannot start without a transport config",
                self.id
            )));
        }
        self.status = to;
        Ok(())
    }
}

/// Proxy record exposed to the API. Never carries `config`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyView {
    pub id: Uuid,
    pub connector_id: Uuid,
    pub provider: String,
    pub key: String,
    pub name: String,
    pub status: ProxyStatus,
    pub fingerprint: Option<Fingerprint>,
    pub fingerprint_error: Option<String>,
    pub disconnected_ts: Option<i64>,
    pub created_ts: i64,
    pub next_refresh_ts: i64,
}

impl From<&Proxy> for ProxyView {
    fn from(proxy: &Proxy) -> Self {
        Self {
            id: proxy.id,
            connector_id: proxy.connector_id,
            provider: proxy.provider.clone(),
            key: proxy.key.clone(),
            name: proxy.name.clone(),
            status: proxy.status,
            fingerprint: proxy.fingerprint.clone(),
            fingerprint_error: proxy.fingerprint_error.clone(),
            disconnected_ts: proxy.disconnected_ts,
            created_ts: proxy.created_ts,
            next_refresh_ts: proxy.next_refresh_ts,
        }
    }
}
