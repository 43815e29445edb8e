use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::endpoint_pool::{self, EndpointSource, ENDPOINT_TASK_STEPS};
use super::{parse_settings, Capabilities, ConnectorProvider};
use crate::error::{PoolError, Result};
use crate::models::{Connector, ProxyStatus, Task, TaskKind};
use crate::tasks::{TaskCommand, TaskContext};
use crate::transports::generic::ProxyUrl;

#[derive(Debug, Deserialize)]
pub struct ProxyListConfig {
    pub urls: Vec<String>,
}

/// User supplied proxy URLs. Each URL is probed as a free proxy first and
/// only handed out while it answers.
pub struct ProxyListProvider;

impl ProxyListProvider {
    /// Configured URLs of a connector, empty when the config is unreadable.
    pub fn urls(connector: &Connector) -> Vec<String> {
        parse_settings::<ProxyListConfig>(&connector.config, "config")
            .map(|config| config.urls)
            .unwrap_or_default()
    }
}

struct OnlineFreeProxies;

#[async_trait]
impl EndpointSource for OnlineFreeProxies {
    async fn allocate(
        &self,
        ctx: &TaskContext,
        _connector: &Connector,
        in_use: &HashSet<String>,
        count: usize,
    ) -> Result<Vec<String>> {
        Ok(ctx
            .list_free_proxies()
            .await?
            .into_iter()
            .filter(|free_proxy| free_proxy.is_online() && !in_use.contains(&free_proxy.key))
            .take(count)
            .map(|free_proxy| free_proxy.key)
            .collect())
    }

    fn initial_status(&self) -> ProxyStatus {
        ProxyStatus::Started
    }
}

impl ConnectorProvider for ProxyListProvider {
    fn provider_type(&self) -> &'static str {
        "proxy-list"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn transport(&self) -> &'static str {
        "generic"
    }

    fn validate_credential(&self, _credential: &Value) -> Result<()> {
        Ok(())
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let config: ProxyListConfig = parse_settings(config, "config")?;
        let mut seen = HashSet::new();
        for url in &config.urls {
            ProxyUrl::parse(url)?;
            if !seen.insert(url) {
                return Err(PoolError::Validation(format!("duplicate proxy URL '{}'", url)));
            }
        }
        Ok(())
    }

    fn capacity(&self, connector: &Connector) -> Option<usize> {
        Some(Self::urls(connector).len())
    }

    fn task_steps(&self, _kind: TaskKind) -> u32 {
        ENDPOINT_TASK_STEPS
    }

    fn build_task_command(&self, task: &Task) -> Result<Box<dyn TaskCommand>> {
        endpoint_pool::build_command(Arc::new(OnlineFreeProxies), task.kind)
    }
}
