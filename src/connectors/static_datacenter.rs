use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::endpoint_pool::{self, EndpointSource, ENDPOINT_TASK_STEPS};
use super::{parse_settings, Capabilities, ConnectorProvider};
use crate::error::{PoolError, Result};
use crate::models::{Connector, Task, TaskKind};
use crate::net::Address;
use crate::tasks::{TaskCommand, TaskContext};
use crate::transports::datacenter::DatacenterCredential;

#[derive(Debug, Deserialize)]
struct StaticDatacenterConfig {
    endpoints: Vec<String>,
}

/// Fixed list of datacenter proxies bought from a reseller.
pub struct StaticDatacenterProvider;

struct Endpoints;

#[async_trait]
impl EndpointSource for Endpoints {
    async fn allocate(
        &self,
        _ctx: &TaskContext,
        connector: &Connector,
        in_use: &HashSet<String>,
        count: usize,
    ) -> Result<Vec<String>> {
        let config: StaticDatacenterConfig = parse_settings(&connector.config, "config")?;
        Ok(config
            .endpoints
            .into_iter()
            .filter(|endpoint| !in_use.contains(endpoint))
            .take(count)
            .collect())
    }
}

impl ConnectorProvider for StaticDatacenterProvider {
    fn provider_type(&self) -> &'static str {
        "static-datacenter"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn transport(&self) -> &'static str {
        "datacenter"
    }

    fn validate_credential(&self, credential: &Value) -> Result<()> {
        let credential: DatacenterCredential = parse_settings(credential, "credential")?;
        if credential.password.is_some() && credential.username.is_none() {
            return Err(PoolError::Validation(
                "credential password requires a username".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let config: StaticDatacenterConfig = parse_settings(config, "config")?;
        if config.endpoints.is_empty() {
            return Err(PoolError::Validation(
                "config needs at least one endpoint".to_string(),
            ));
        }
        for endpoint in &config.endpoints {
            Address::parse(endpoint)?;
        }
        Ok(())
    }

    fn capacity(&self, connector: &Connector) -> Option<usize> {
        parse_settings::<StaticDatacenterConfig>(&connector.config, "config")
            .map(|config| config.endpoints.len())
            .ok()
    }

    fn task_steps(&self, _kind: TaskKind) -> u32 {
        ENDPOINT_TASK_STEPS
    }

    fn build_task_command(&self, task: &Task) -> Result<Box<dyn TaskCommand>> {
        endpoint_pool::build_command(Arc::new(Endpoints), task.kind)
    }
}
