use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Connector;
use crate::error::{PoolError, Result};

const MIN_DELAY_MS: i64 = 30_000;

/// Activity level driving how many proxies a project keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectStatus {
    /// No proxies at all
    Off,
    /// Only `proxiesMin` proxies on the default connector
    Calm,
    /// Every connector at `proxiesMax`
    Hot,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Off => "off",
            ProjectStatus::Calm => "calm",
            ProjectStatus::Hot => "hot",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        [ProjectStatus::Off, ProjectStatus::Calm, ProjectStatus::Hot]
            .into_iter()
            .find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Millisecond bounds, `min <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: i64,
    pub max: i64,
}

/// Pool policy shared by every connector of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub status: ProjectStatus,
    /// Connector that keeps `proxies_min` proxies while the project is calm
    pub connector_default_id: Option<Uuid>,
    pub proxies_min: u32,
    pub auto_rotate: bool,
    pub auto_rotate_delay_range: DelayRange,
    /// Relay traffic wakes a calm project up
    pub auto_scale_up: bool,
    /// A hot project without traffic calms down after `auto_scale_down_delay`
    pub auto_scale_down: bool,
    pub auto_scale_down_delay: i64,
    pub last_data_ts: i64,
    pub created_ts: i64,
    pub updated_ts: i64,
}

impl Project {
    pub fn new(id: Uuid, name: impl Into<String>, now: i64) -> Self {
        Self {
            id,
            name: name.into(),
            status: ProjectStatus::Hot,
            connector_default_id: None,
            proxies_min: 1,
            auto_rotate: false,
            auto_rotate_delay_range: DelayRange {
                min: 30 * 60_000,
                max: 60 * 60_000,
            },
            auto_scale_up: true,
            auto_scale_down: false,
            auto_scale_down_delay: 10 * 60_000,
            last_data_ts: now,
            created_ts: now,
            updated_ts: now,
        }
    }

    /// Policy applied to connectors of a project that has no settings record:
    /// always hot, nothing automatic.
    pub fn unmanaged(id: Uuid) -> Self {
        Self {
            auto_scale_up: false,
            ..Self::new(id, "", 0)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PoolError::Validation("name must not be empty".to_string()));
        }
        if self.proxies_min < 1 {
            return Err(PoolError::Validation("proxiesMin must be at least 1".to_string()));
        }
        let range = &self.auto_rotate_delay_range;
        if range.min < MIN_DELAY_MS || range.max < range.min {
            return Err(PoolError::Validation(format!(
                "autoRotateDelayRange must satisfy {} <= min <= max",
                MIN_DELAY_MS
            )));
        }
        if self.auto_scale_down_delay < MIN_DELAY_MS {
            return Err(PoolError::Validation(format!(
                "autoScaleDownDelay must be at least {} ms",
                MIN_DELAY_MS
            )));
        }
        Ok(())
    }

    /// Proxies `connector` should hold under the current status.
    pub fn desired_size(&self, connector: &Connector) -> u32 {
        match self.status {
            ProjectStatus::Off => 0,
            ProjectStatus::Calm if self.connector_default_id == Some(connector.id) => {
                self.proxies_min.min(connector.proxies_max)
            }
            ProjectStatus::Calm => 0,
            ProjectStatus::Hot => connector.proxies_max,
        }
    }

    /// Switch status. Going hot counts as fresh data so the project does not
    /// immediately scale back down.
    pub fn set_status(&mut self, status: ProjectStatus, now: i64) -> bool {
        if self.status == status {
            return false;
        }
        self.status = status;
        if status == ProjectStatus::Hot {
            self.last_data_ts = now;
        }
        self.updated_ts = now;
        true
    }

    /// Account for relay traffic seen at `ts`. Returns whether anything changed.
    pub fn record_data(&mut self, ts: i64) -> bool {
        if ts <= self.last_data_ts {
            return false;
        }
        self.last_data_ts = ts;
        if self.auto_scale_up && self.status == ProjectStatus::Calm {
            self.status = ProjectStatus::Hot;
            self.updated_ts = ts;
        }
        true
    }

    /// Calm a hot project that saw no data for `auto_scale_down_delay`.
    pub fn scale_down_if_idle(&mut self, now: i64) -> bool {
        if self.auto_scale_down
            && self.status == ProjectStatus::Hot
            && now - self.last_data_ts > self.auto_scale_down_delay
        {
            self.status = ProjectStatus::Calm;
            self.updated_ts = now;
            return true;
        }
        false
    }

    /// Auto-rotate only retires proxies of hot projects.
    pub fn rotates(&self) -> bool {
        self.auto_rotate && self.status == ProjectStatus::Hot
    }
}
