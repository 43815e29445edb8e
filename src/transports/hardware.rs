use std::time::Duration;

use http::{HeaderMap, HeaderValue, Method};
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

/// Header selecting the modem behind a hardware farm endpoint.
pub const MODEM_HEADER: &str = "x-modem-id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Farm ingress as `host:port`
    pub endpoint: String,
    pub modems: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareCredential {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareProxyConfig {
    pub address: String,
    pub modem_id: String,
    pub token: String,
}

/// User-owned modem farm behind a single ingress.
pub struct HardwareTransport;

impl Transport for HardwareTransport {
    fn name(&self) -> &'static str {
        "hardware"
    }

    fn category(&self) -> TransportCategory {
        TransportCategory::Hardware
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
        let config: HardwareProxyConfig = proxy_config(proxy_config_value)?;

        let mut extra_headers = HeaderMap::new();
        extra_headers.insert(
            MODEM_HEADER,
            HeaderValue::from_str(&config.modem_id)
                .map_err(|e| PoolError::Validation(format!("invalid modem id: {}", e)))?,
        );

        let hop = ProxyHop {
            address: Address::parse(&config.address)?,
            tls: None,
            authorization: Some(basic_auth(&config.token, "")?),
            extra_headers,
            always_tunnel: false,
        };
        forward_proxy_args(hop, method, target, headers, registry, timeout)
    }

    fn complete_proxy_config(&self, proxy: &mut Proxy, connector: &Connector) -> Result<()> {
        let config: HardwareConfig = parse_config(&connector.config, "hardware config")?;
        let credential: HardwareCredential =
            parse_config(&connector.credential, "hardware credential")?;
        let endpoint = Address::parse(&config.endpoint)?;

        if !config.modems.iter().any(|modem| modem == &proxy.key) {
            return Err(PoolError::Validation(format!(
                "modem '{}' is not part of connector {}",
                proxy.key, connector.id
            )));
        }

        proxy.config = Some(serde_json::to_value(HardwareProxyConfig {
            address: endpoint.to_string(),
            modem_id: proxy.key.clone(),
            token: credential.token,
        })?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Tunnel;
    use serde_json::json;
    use uuid::Uuid;

    fn connector() -> Connector {
        Connector::new(
            Uuid::new_v4(),
            "farm",
            "hardware",
            json!({ "token": "t0k3n" }),
            json!({ "endpoint": "192.168.1.10:8080", "modems": ["m1", "m2"] }),
            2,
            0,
        )
    }

    #[test]
    fn test_modem_header_reaches_the_farm() {
        let connector = connector();
        let mut proxy = Proxy::to_create(connector.project_id, connector.id, "hardware", 0);
        proxy.key = "m2".to_string();
        HardwareTransport
            .complete_proxy_config(&mut proxy, &connector)
            .unwrap();

        let args = HardwareTransport
            .build_request_args(
                Method::GET,
                &Url::parse("https://example.com/").unwrap(),
                HeaderMap::new(),
                proxy.config.as_ref().unwrap(),
                &SocketRegistry::new(),
                Some(Duration::from_secs(3)),
            )
            .unwrap();

        match args.tunnel {
            Some(Tunnel::Connect { headers, .. }) => {
                assert_eq!(headers[MODEM_HEADER], "m2");
            }
            other => panic!("expected CONNECT tunnel, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_modem_is_rejected() {
        let connector = connector();
        let mut proxy = Proxy::to_create(connector.project_id, connector.id, "hardware", 0);
        proxy.key = "m9".to_string();
        assert!(HardwareTransport
            .complete_proxy_config(&mut proxy, &connector)
            .is_err());
    }
}
