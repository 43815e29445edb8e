use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// PEM encoded client certificate pair shared by a connector's proxies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub cert: String,
    pub key: String,
}

/// Binding between a provider type, a credential and a desired capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    /// Provider type key in the connector registry
    pub provider: String,
    pub credential: Value,
    pub config: Value,
    /// Desired number of live proxies
    pub proxies_max: u32,
    pub active: bool,
    pub installed: bool,
    pub certificate: Option<Certificate>,
    pub error: Option<String>,
    pub created_ts: i64,
    pub updated_ts: i64,
}

impl Connector {
    pub fn new(
        project_id: Uuid,
        name: impl Into<String>,
        provider: impl Into<String>,
        credential: Value,
        config: Value,
        proxies_max: u32,
        now: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            provider: provider.into(),
            credential,
            config,
            proxies_max,
            active: false,
            installed: false,
            certificate: None,
            error: None,
            created_ts: now,
            updated_ts: now,
        }
    }
}

/// Connector record exposed to the API. Credentials and key material stay server-side.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorView {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub provider: String,
    pub config: Value,
    pub proxies_max: u32,
    pub active: bool,
    pub installed: bool,
    pub has_certificate: bool,
    pub error: Option<String>,
    pub created_ts: i64,
    pub updated_ts: i64,
}

impl From<&Connector> for ConnectorView {
    fn from(connector: &Connector) -> Self {
        Self {
            id: connector.id,
            project_id: connector.project_id,
            name: connector.name.clone(),
            provider: connector.provider.clone(),
            config: connector.config.clone(),
            proxies_max: connector.proxies_max,
            active: connector.active,
            installed: connector.installed,
            has_certificate: connector.certificate.is_some(),
            error: connector.error.clone(),
            created_ts: connector.created_ts,
            updated_ts: connector.updated_ts,
        }
    }
}
