use std::time::Duration;

use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{
    basic_auth, forward_proxy_args, parse_config, proxy_config, ProxyHop, Transport,
    TransportCategory,
};
use crate::error::{PoolError, Result};
use crate::models::{Connector, Proxy};
use crate::net::{Address, RequestArgs, SocketRegistry};

fn default_lifetime() -> u32 {
    30
}

/// Connector-level settings of a rotating-session gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResidentialConfig {
    /// Gateway ingress as `host:port`
    pub gateway: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    /// Minutes a session keeps the same exit IP
    #[serde(default = "default_lifetime")]
    pub session_lifetime: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidentialCredential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidentialProxyConfig {
    pub address: String,
    pub username: String,
    pub password: String,
}

/// Session-based residential gateway. Every proxy is one sticky session.
pub struct ResidentialTransport;

impl ResidentialTransport {
    /// Username encoding session, lifetime and geo targeting.
    pub fn session_username(
        customer: &str,
        session: &str,
        config: &ResidentialConfig,
    ) -> Result<String> {
        if session.is_empty() || !session.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(PoolError::Validation(format!(
                "invalid session key '{}'",
                session
            )));
        }

        let mut username = format!(
            "{}-session-{}-lifetime-{}m",
            customer, session, config.session_lifetime
        );
        if let Some(country) = &config.country {
            username.push_str(&format!("-country-{}", country.to_lowercase()));
        }
        if let Some(city) = &config.city {
            let city: String = city
                .to_lowercase()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            username.push_str(&format!("-city-{}", city));
        }
        Ok(username)
    }
}

impl Transport for ResidentialTransport {
    fn name(&self) -> &'static str {
        "residential"
    }

    fn category(&self) -> TransportCategory {
        TransportCategory::Residential
    }

    fn build_request_args(
        &self,
        method: Method,
        target: &Url,
        headers: HeaderMap,
        proxy_config_value: &Value,
        registry: &SocketRegistry,
        timeout: Option<Duration>,
    ) -> Result<RequestArgs> {
        let config: ResidentialProxyConfig = proxy_config(proxy_config_value)?;
        let hop = ProxyHop {
            address: Address::parse(&config.address)?,
            tls: None,
            authorization: Some(basic_auth(&config.username, &config.password)?),
            extra_headers: HeaderMap::new(),
            always_tunnel: false,
        };
        forward_proxy_args(hop, method, target, headers, registry, timeout)
    }

    fn complete_proxy_config(&self, proxy: &mut Proxy, connector: &Connector) -> Result<()> {
        let config: ResidentialConfig = parse_config(&connector.config, "residential config")?;
        let credential: ResidentialCredential =
            parse_config(&connector.credential, "residential credential")?;
        let gateway = Address::parse(&config.gateway)?;

        proxy.config = Some(serde_json::to_value(ResidentialProxyConfig {
            address: gateway.to_string(),
            username: Self::session_username(&credential.username, &proxy.key, &config)?,
            password: credential.password,
        })?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn config() -> ResidentialConfig {
        ResidentialConfig {
            gateway: "gw.example:12321".to_string(),
            country: Some("FR".to_string()),
            city: Some("Le Havre".to_string()),
            session_lifetime: 10,
        }
    }

    #[test]
    fn test_session_username_encodes_targeting() {
        let username = ResidentialTransport::session_username("cust", "abc123", &config()).unwrap();
        assert_eq!(
            username,
            "cust-session-abc123-lifetime-10m-country-fr-city-lehavre"
        );
    }

    #[test]
    fn test_invalid_session_key_is_rejected() {
        assert!(ResidentialTransport::session_username("cust", "", &config()).is_err());
        assert!(ResidentialTransport::session_username("cust", "a-b", &config()).is_err());
    }

    #[test]
    fn test_complete_config_rejects_bad_gateway() {
        let connector = Connector::new(
            Uuid::new_v4(),
            "resi",
            "residential",
            json!({ "username": "cust", "password": "pw" }),
            json!({ "gateway": "gw.example" }),
            3,
            0,
        );
        let mut proxy = Proxy::to_create(connector.project_id, connector.id, "residential", 0);
        proxy.key = "abc".to_string();

        let err = ResidentialTransport
            .complete_proxy_config(&mut proxy, &connector)
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidProxyAddress(_)));
    }

    #[test]
    fn test_complete_config_builds_credentials() {
        let connector = Connector::new(
            Uuid::new_v4(),
            "resi",
            "residential",
            json!({ "username": "cust", "password": "pw" }),
            json!({ "gateway": "gw.example:12321", "country": "us" }),
            3,
            0,
        );
        let mut proxy = Proxy::to_create(connector.project_id, connector.id, "residential", 0);
        proxy.key = "s1".to_string();

        ResidentialTransport
            .complete_proxy_config(&mut proxy, &connector)
            .unwrap();
        let config: ResidentialProxyConfig =
            serde_json::from_value(proxy.config.unwrap()).unwrap();
        assert_eq!(config.address, "gw.example:12321");
        assert_eq!(config.username, "cust-session-s1-lifetime-30m-country-us");
        assert_eq!(config.password, "pw");
    }
}
