use std::time::Duration;

use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{
    basic_auth, forward_proxy_args, parse_config, proxy_config, ProxyHop, Transport,
    TransportCategory,
};
use crate::error::Result;
use crate::models::{Connector, Proxy};
use crate::net::{Address, RequestArgs, SocketRegistry};

/// Credential shared by every endpoint of a static datacenter connector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatacenterCredential {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatacenterProxyConfig {
    pub address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Static datacenter endpoints reached as HTTP forward proxies.
pub struct DatacenterTransport;

impl Transport for DatacenterTransport {
    fn name(&self) -> &'static str {
        "datacenter"
    }

    fn category(&self) -> TransportCategory {
        TransportCategory::Datacenter
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
        let config: DatacenterProxyConfig = proxy_config(proxy_config_value)?;
        let authorization = match &config.username {
            Some(username) => Some(basic_auth(
                username,
                config.password.as_deref().unwrap_or_default(),
            )?),
            None => None,
        };

        let hop = ProxyHop {
            address: Address::parse(&config.address)?,
            tls: None,
            authorization,
            extra_headers: HeaderMap::new(),
            always_tunnel: false,
        };
        forward_proxy_args(hop, method, target, headers, registry, timeout)
    }

    fn complete_proxy_config(&self, proxy: &mut Proxy, connector: &Connector) -> Result<()> {
        let credential: DatacenterCredential =
            parse_config(&connector.credential, "datacenter credential")?;
        let address = Address::parse(&proxy.key)?;

        proxy.config = Some(serde_json::to_value(DatacenterProxyConfig {
            address: address.to_string(),
            username: credential.username,
            password: credential.password,
        })?);
        Ok(())
    }
}
