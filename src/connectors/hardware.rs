use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::endpoint_pool::{self, EndpointSource, ENDPOINT_TASK_STEPS};
use super::{parse_settings, Capabilities, ConnectorProvider};
use crate::error::{PoolError, Result};
use crate::models::{Connector, Task, TaskKind};
use crate::net::Address;
use crate::tasks::{TaskCommand, TaskContext};
use crate::transports::hardware::{HardwareConfig, HardwareCredential};

/// Modem farm operated by the user; one proxy per modem.
pub struct HardwareProvider;

struct Modems;

#[async_trait]
impl EndpointSource for Modems {
    async fn allocate(
        &self,
        _ctx: &TaskContext,
        connector: &Connector,
        in_use: &HashSet<String>,
        count: usize,
    ) -> Result<Vec<String>> {
        let config: HardwareConfig = parse_settings(&connector.config, "config")?;
        Ok(config
            .modems
            .into_iter()
            .filter(|modem| !in_use.contains(modem))
            .take(count)
            .collect())
    }
}

impl ConnectorProvider for HardwareProvider {
    fn provider_type(&self) -> &'static str {
        "hardware"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            // Modems reconnect slowly after a reboot.
            probe_failure_threshold: 5,
            ..Capabilities::default()
        }
    }

    fn transport(&self) -> &'static str {
        "hardware"
    }

    fn validate_credential(&self, credential: &Value) -> Result<()> {
        let credential: HardwareCredential = parse_settings(credential, "credential")?;
        if credential.token.trim().is_empty() {
            return Err(PoolError::Validation("token is required".to_string()));
        }
        Ok(())
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let config: HardwareConfig = parse_settings(config, "config")?;
        Address::parse(&config.endpoint)?;

        let mut seen = HashSet::new();
        for modem in &config.modems {
            if modem.trim().is_empty() {
                return Err(PoolError::Validation("modem id cannot be empty".to_string()));
            }
            if !seen.insert(modem) {
                return Err(PoolError::Validation(format!("duplicate modem '{}'", modem)));
            }
        }
        Ok(())
    }

    fn capacity(&self, connector: &Connector) -> Option<usize> {
        parse_settings::<HardwareConfig>(&connector.config, "config")
            .map(|config| config.modems.len())
            .ok()
    }

    fn task_steps(&self, _kind: TaskKind) -> u32 {
        ENDPOINT_TASK_STEPS
    }

    fn build_task_command(&self, task: &Task) -> Result<Box<dyn TaskCommand>> {
        endpoint_pool::build_command(Arc::new(Modems), task.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duplicate_modems_are_rejected() {
        let err = HardwareProvider
            .validate_config(&json!({ "endpoint": "192.168.1.10:8080", "modems": ["m1", "m1"] }))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate modem"));
    }

    #[test]
    fn test_blank_token_is_rejected() {
        assert!(HardwareProvider
            .validate_credential(&json!({ "token": "  " }))
            .is_err());
        HardwareProvider
            .validate_credential(&json!({ "token": "t0k3n" }))
            .unwrap();
    }
}
