use std::time::Duration;

use http::{HeaderMap, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{forward_proxy_args, proxy_config, ProxyHop, Transport, TransportCategory};
use crate::error::{PoolError, Result};
use crate::models::{Certificate, Connector, Fingerprint, Proxy, FINGERPRINT_HEADER};
use crate::net::{Address, RequestArgs, SocketRegistry, TlsOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudProxyConfig {
    pub address: String,
    #[serde(default)]
    pub certificate: Option<Certificate>,
    #[serde(default)]
    pub fingerprint_force: Option<Fingerprint>,
}

#[derive(Debug, Deserialize)]
struct RegionConfig {
    region: String,
}

/// Instances running the pool's own proxy software, reached over mutual TLS.
///
/// The local flavor stamps a synthetic fingerprint derived from the
/// connector region on every request so fingerprinting stays deterministic.
pub struct CloudTransport {
    forced_fingerprint: bool,
}

impl CloudTransport {
    pub fn production() -> Self {
        Self {
            forced_fingerprint: false,
        }
    }

    pub fn local() -> Self {
        Self {
            forced_fingerprint: true,
        }
    }
}

impl Transport for CloudTransport {
    fn name(&self) -> &'static str {
        if self.forced_fingerprint {
            "cloud-local"
        } else {
            "cloud"
        }
    }

    fn category(&self) -> TransportCategory {
        TransportCategory::Cloud
    }

    fn build_request_args(
        &self,
        method: Method,
        target: &Url,
        mut headers: HeaderMap,
        proxy_config_value: &Value,
        registry: &SocketRegistry,
        timeout: Option<Duration>,
    ) -> Result<RequestArgs> {
        let config: CloudProxyConfig = proxy_config(proxy_config_value)?;
        let certificate = config.certificate.ok_or_else(|| {
            PoolError::Validation("cloud proxy config has no certificate".to_string())
        })?;

        if self.forced_fingerprint {
            if let Some(fingerprint) = &config.fingerprint_force {
                let value = HeaderValue::from_str(&fingerprint.to_header_value()?)
                    .map_err(|e| PoolError::InvalidRequest(e.to_string()))?;
                headers.insert(FINGERPRINT_HEADER, value);
            }
        }

        let hop = ProxyHop {
            address: Address::parse(&config.address)?,
            tls: Some(TlsOptions::mutual(certificate)),
            authorization: None,
            extra_headers: HeaderMap::new(),
            always_tunnel: true,
        };
        forward_proxy_args(hop, method, target, headers, registry, timeout)
    }

    fn complete_proxy_config(&self, proxy: &mut Proxy, connector: &Connector) -> Result<()> {
        let certificate = connector.certificate.clone().ok_or_else(|| {
            PoolError::Validation(format!("connector {} has no certificate", connector.id))
        })?;

        let address = proxy
            .config
            .as_ref()
            .and_then(|config| config.get("address"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PoolError::Validation(format!("proxy {} has no ingress address", proxy.id))
            })?;
        let address = Address::parse(address)?;

        let fingerprint_force = if self.forced_fingerprint {
            let region: RegionConfig = super::parse_config(&connector.config, "connector config")?;
            Some(Fingerprint::synthetic(&region.region))
        } else {
            None
        };

        proxy.config = Some(serde_json::to_value(CloudProxyConfig {
            address: address.to_string(),
            certificate: Some(certificate),
            fingerprint_force,
        })?);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    pub(crate) fn test_certificate() -> Certificate {
        Certificate {
            cert: include_str!("testdata/ingress.crt").to_string(),
            key: include_str!("testdata/ingress.key").to_string(),
        }
    }

    fn connector() -> Connector {
        let mut connector = Connector::new(
            Uuid::new_v4(),
            "local",
            "datacenter-local",
            json!({}),
            json!({ "region": "europe" }),
            2,
            0,
        );
        connector.certificate = Some(test_certificate());
        connector
    }

    fn provisioned(connector: &Connector) -> Proxy {
        let mut proxy = Proxy::to_create(connector.project_id, connector.id, "datacenter-local", 0);
        proxy.config = Some(json!({ "address": "127.0.0.1:8888" }));
        proxy
    }

    #[test]
    fn test_local_config_gets_certificate_and_fingerprint() {
        let connector = connector();
        let mut proxy = provisioned(&connector);

        CloudTransport::local()
            .complete_proxy_config(&mut proxy, &connector)
            .unwrap();

        let config: CloudProxyConfig = serde_json::from_value(proxy.config.unwrap()).unwrap();
        assert_eq!(config.certificate, connector.certificate);
        let fingerprint = config.fingerprint_force.unwrap();
        assert_eq!(fingerprint.ip, "1.1.1.1");
        assert_eq!(fingerprint.continent_name.as_deref(), Some("europe"));
    }

    #[test]
    fn test_missing_certificate_fails_fast() {
        let mut connector = connector();
        connector.certificate = None;
        let mut proxy = provisioned(&connector);

        let err = CloudTransport::production()
            .complete_proxy_config(&mut proxy, &connector)
            .unwrap_err();
        assert!(matches!(err, PoolError::Validation(_)));
    }

    #[test]
    fn test_local_injects_header_and_production_does_not() {
        let connector = connector();
        let mut proxy = provisioned(&connector);
        CloudTransport::local()
            .complete_proxy_config(&mut proxy, &connector)
            .unwrap();
        let config = proxy.config.unwrap();
        let target = Url::parse("http://fingerprint.test/json").unwrap();
        let registry = SocketRegistry::new();

        let local = CloudTransport::local()
            .build_request_args(
                Method::GET,
                &target,
                HeaderMap::new(),
                &config,
                &registry,
                Some(Duration::from_secs(1)),
            )
            .unwrap();
        let header = local.headers.get(FINGERPRINT_HEADER).unwrap();
        let decoded = Fingerprint::from_header_value(header.to_str().unwrap()).unwrap();
        assert_eq!(decoded.ip, "1.1.1.1");
        assert!(local.tls.is_some());
        assert!(local.tunnel.is_some());

        let production = CloudTransport::production()
            .build_request_args(
                Method::GET,
                &target,
                HeaderMap::new(),
                &config,
                &registry,
                Some(Duration::from_secs(1)),
            )
            .unwrap();
        assert!(!production.headers.contains_key(FINGERPRINT_HEADER));
    }
}
