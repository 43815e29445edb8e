use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;

use super::endpoint_pool::{self, EndpointSource, ENDPOINT_TASK_STEPS};
use super::{parse_settings, Capabilities, ConnectorProvider};
use crate::error::{PoolError, Result};
use crate::models::{Connector, Proxy, Task, TaskKind};
use crate::net::Address;
use crate::tasks::{TaskCommand, TaskContext};
use crate::transports::residential::{ResidentialConfig, ResidentialCredential};

const SESSION_KEY_LEN: usize = 12;

fn session_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_KEY_LEN)
        .map(char::from)
        .collect()
}

/// Rotating residential gateway. Each proxy is a sticky session, so a
/// failing proxy is replaced by opening a new session.
pub struct ResidentialProvider;

struct Sessions;

#[async_trait]
impl EndpointSource for Sessions {
    async fn allocate(
        &self,
        _ctx: &TaskContext,
        _connector: &Connector,
        in_use: &HashSet<String>,
        count: usize,
    ) -> Result<Vec<String>> {
        let mut keys = HashSet::with_capacity(count);
        while keys.len() < count {
            let key = session_key();
            if !in_use.contains(&key) {
                keys.insert(key);
            }
        }
        Ok(keys.into_iter().collect())
    }
}

impl ConnectorProvider for ResidentialProvider {
    fn provider_type(&self) -> &'static str {
        "residential"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            replace_in_place: true,
            probe_failure_threshold: 2,
            ..Capabilities::default()
        }
    }

    fn transport(&self) -> &'static str {
        "residential"
    }

    fn validate_credential(&self, credential: &Value) -> Result<()> {
        let credential: ResidentialCredential = parse_settings(credential, "credential")?;
        if credential.username.is_empty() || credential.password.is_empty() {
            return Err(PoolError::Validation(
                "username and password are required".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let config: ResidentialConfig = parse_settings(config, "config")?;
        Address::parse(&config.gateway)?;
        if config.session_lifetime == 0 {
            return Err(PoolError::Validation(
                "session lifetime must be at least one minute".to_string(),
            ));
        }
        if let Some(country) = &config.country {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(PoolError::Validation(format!(
                    "country '{}' is not a two letter code",
                    country
                )));
            }
        }
        Ok(())
    }

    fn task_steps(&self, _kind: TaskKind) -> u32 {
        ENDPOINT_TASK_STEPS
    }

    fn build_task_command(&self, task: &Task) -> Result<Box<dyn TaskCommand>> {
        endpoint_pool::build_command(Arc::new(Sessions), task.kind)
    }

    fn replacement_key(&self, _proxy: &Proxy) -> Option<String> {
        Some(session_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_keys_are_alphanumeric() {
        let key = session_key();
        assert_eq!(key.len(), SESSION_KEY_LEN);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_config_validation() {
        let provider = ResidentialProvider;
        provider
            .validate_config(&json!({ "gateway": "gw.example:12321", "country": "fr" }))
            .unwrap();
        assert!(provider
            .validate_config(&json!({ "gateway": "gw.example:12321", "country": "france" }))
            .is_err());
        assert!(provider
            .validate_config(&json!({ "gateway": "gw.example:12321", "sessionLifetime": 0 }))
            .is_err());
    }

    #[test]
    fn test_replacement_key_differs() {
        let proxy = Proxy::to_create(uuid::Uuid::nil(), uuid::Uuid::nil(), "residential", 0);
        let provider = ResidentialProvider;
        assert!(provider.capabilities().replace_in_place);
        assert_ne!(provider.replacement_key(&proxy), provider.replacement_key(&proxy));
    }
}
