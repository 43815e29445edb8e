//! Connector contract: per-provider capability description, validation and
//! task command factory.

pub mod datacenter_local;
pub mod endpoint_pool;
pub mod hardware;
pub mod proxy_list;
pub mod residential;
pub mod static_datacenter;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{PoolError, Result};
use crate::models::{Connector, Proxy, Task, TaskKind};
use crate::tasks::TaskCommand;
use crate::transports::TransportRegistry;

pub use datacenter_local::{DatacenterApi, DatacenterLocalProvider, LocalDatacenter};
pub use hardware::HardwareProvider;
pub use proxy_list::ProxyListProvider;
pub use residential::ResidentialProvider;
pub use static_datacenter::StaticDatacenterProvider;

/// Static description the reconciliation loop plans with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Needs an install task before proxies can be created
    pub installable: bool,
    pub uninstallable: bool,
    /// A failing proxy can be re-keyed instead of removed
    pub replace_in_place: bool,
    pub requires_certificate: bool,
    /// How far a successful probe pushes the next probe
    pub refresh_delay: Duration,
    /// Consecutive failed probes before the proxy is replaced or removed
    pub probe_failure_threshold: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            installable: false,
            uninstallable: false,
            replace_in_place: false,
            requires_certificate: false,
            refresh_delay: Duration::from_secs(30),
            probe_failure_threshold: 3,
        }
    }
}

/// One backend provider type.
pub trait ConnectorProvider: Send + Sync {
    /// Registry key, stored on connectors and proxies
    fn provider_type(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Name of the transport proxies of this provider go through
    fn transport(&self) -> &'static str;

    fn validate_credential(&self, credential: &Value) -> Result<()>;

    fn validate_config(&self, config: &Value) -> Result<()>;

    /// Upper bound on the proxy count, for providers backed by a finite list.
    fn capacity(&self, _connector: &Connector) -> Option<usize> {
        None
    }

    /// Number of steps a task of `kind` goes through.
    fn task_steps(&self, kind: TaskKind) -> u32;

    fn build_task_command(&self, task: &Task) -> Result<Box<dyn TaskCommand>>;

    /// Fresh key for an in-place replacement of `proxy`.
    fn replacement_key(&self, _proxy: &Proxy) -> Option<String> {
        None
    }
}

/// Task data of create and remove tasks: the proxy records involved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyBatch {
    pub proxy_ids: Vec<Uuid>,
}

impl ProxyBatch {
    pub fn new(proxy_ids: Vec<Uuid>) -> Self {
        Self { proxy_ids }
    }

    pub fn from_task(task: &Task) -> Result<Self> {
        serde_json::from_value(task.data.clone())
            .map_err(|e| PoolError::TaskTerminal(format!("invalid task data: {}", e)))
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Providers by type. Registration happens once at startup.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    providers: HashMap<&'static str, Arc<dyn ConnectorProvider>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every provider shipped with the crate.
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(DatacenterLocalProvider::new(Arc::new(
            LocalDatacenter::default(),
        ))))?;
        registry.register(Arc::new(StaticDatacenterProvider))?;
        registry.register(Arc::new(ResidentialProvider))?;
        registry.register(Arc::new(HardwareProvider))?;
        registry.register(Arc::new(ProxyListProvider))?;
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn ConnectorProvider>) -> Result<()> {
        let provider_type = provider.provider_type();
        if self.providers.contains_key(provider_type) {
            return Err(PoolError::DuplicateRegistration(format!(
                "connector type {}",
                provider_type
            )));
        }
        self.providers.insert(provider_type, provider);
        Ok(())
    }

    pub fn get(&self, provider_type: &str) -> Result<Arc<dyn ConnectorProvider>> {
        self.providers
            .get(provider_type)
            .cloned()
            .ok_or_else(|| PoolError::ProviderNotFound(provider_type.to_string()))
    }

    pub fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.providers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Every provider must name a registered transport.
    pub fn check_transports(&self, transports: &TransportRegistry) -> Result<()> {
        for provider in self.providers.values() {
            transports.get(provider.transport()).map_err(|_| {
                PoolError::InvalidConfig(format!(
                    "connector type {} uses unknown transport {}",
                    provider.provider_type(),
                    provider.transport()
                ))
            })?;
        }
        Ok(())
    }
}

/// Deserialize connector-owned JSON, reporting problems as validation errors.
pub(crate) fn parse_settings<T: serde::de::DeserializeOwned>(value: &Value, what: &str) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| PoolError::Validation(format!("invalid {}: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_provider_type_is_fatal() {
        let mut registry = ConnectorRegistry::with_defaults().unwrap();
        let err = registry
            .register(Arc::new(StaticDatacenterProvider))
            .unwrap_err();
        assert!(matches!(err, PoolError::DuplicateRegistration(_)));
    }

    #[test]
    fn test_default_providers_have_transports() {
        let registry = ConnectorRegistry::with_defaults().unwrap();
        let transports = TransportRegistry::with_defaults().unwrap();
        registry.check_transports(&transports).unwrap();
        assert_eq!(
            registry.types(),
            vec![
                "datacenter-local",
                "hardware",
                "proxy-list",
                "residential",
                "static-datacenter"
            ]
        );
        assert!(matches!(
            registry.get("mainframe").err().unwrap(),
            PoolError::ProviderNotFound(_)
        ));
    }

    #[test]
    fn test_proxy_batch_from_garbage_is_terminal() {
        let task = Task::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            TaskKind::CreateProxies,
            1,
            serde_json::json!({ "proxyIds": "nope" }),
            0,
        );
        let err = ProxyBatch::from_task(&task).unwrap_err();
        assert!(err.is_terminal());
    }
}
