//! Transport contract: turns a proxy's logical config into physical request arguments.

pub mod cloud;
pub mod datacenter;
pub mod fingerprint;
pub mod generic;
pub mod hardware;
pub mod residential;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use http::header::{HOST, PROXY_AUTHORIZATION};
use http::{HeaderMap, HeaderValue, Method, Uri};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::error::{PoolError, Result};
use crate::models::{Connector, Proxy};
use crate::net::{Address, RequestArgs, SocketRegistry, TlsOptions, Tunnel};

pub use cloud::CloudTransport;
pub use datacenter::DatacenterTransport;
pub use fingerprint::{FingerprintOptions, FingerprintProbe, FingerprintRequest};
pub use generic::GenericTransport;
pub use hardware::HardwareTransport;
pub use residential::ResidentialTransport;

/// Backend category a transport belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCategory {
    Datacenter,
    Cloud,
    Residential,
    Hardware,
    GenericProxy,
}

/// Strategy turning a proxy's config into a physical request.
pub trait Transport: Send + Sync {
    /// Registry key
    fn name(&self) -> &'static str;

    fn category(&self) -> TransportCategory;

    /// Physical request arguments for `method target` through the proxy.
    ///
    /// `CONNECT` produces a raw tunnel to the target's authority.
    fn build_request_args(
        &self,
        method: Method,
        target: &Url,
        headers: HeaderMap,
        proxy_config: &Value,
        registry: &SocketRegistry,
        timeout: Option<Duration>,
    ) -> Result<RequestArgs>;

    /// Finish `proxy.config` from connector settings after (re)provisioning.
    fn complete_proxy_config(&self, proxy: &mut Proxy, connector: &Connector) -> Result<()>;
}

/// Transports by name. Registration happens once at startup.
#[derive(Default, Clone)]
pub struct TransportRegistry {
    transports: HashMap<&'static str, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transport shipped with the crate.
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(DatacenterTransport))?;
        registry.register(Arc::new(CloudTransport::production()))?;
        registry.register(Arc::new(CloudTransport::local()))?;
        registry.register(Arc::new(ResidentialTransport))?;
        registry.register(Arc::new(HardwareTransport))?;
        registry.register(Arc::new(GenericTransport))?;
        Ok(registry)
    }

    pub fn register(&mut self, transport: Arc<dyn Transport>) -> Result<()> {
        let name = transport.name();
        if self.transports.contains_key(name) {
            return Err(PoolError::DuplicateRegistration(format!("transport {}", name)));
        }
        self.transports.insert(name, transport);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Transport>> {
        self.transports
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::TransportNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.transports.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// First hop of a proxied request.
pub(crate) struct ProxyHop {
    pub address: Address,
    pub tls: Option<TlsOptions>,
    /// Sent as `Proxy-Authorization` on forwarded requests and CONNECT
    pub authorization: Option<HeaderValue>,
    /// Headers attached to the CONNECT request or the forwarded request
    pub extra_headers: HeaderMap,
    /// Tunnel even plain HTTP targets
    pub always_tunnel: bool,
}

/// Request arguments for an HTTP forward proxy hop.
///
/// HTTPS targets and `CONNECT` go through a tunnel; plain HTTP is sent in
/// absolute-form unless the hop always tunnels.
pub(crate) fn forward_proxy_args(
    hop: ProxyHop,
    method: Method,
    target: &Url,
    mut headers: HeaderMap,
    registry: &SocketRegistry,
    timeout: Option<Duration>,
) -> Result<RequestArgs> {
    let target_address = Address::from_url(target)?;
    let authority = target_address.to_string();
    let secure = target.scheme() == "https";

    let mut proxy_headers = hop.extra_headers.clone();
    if let Some(authorization) = &hop.authorization {
        proxy_headers.insert(PROXY_AUTHORIZATION, authorization.clone());
    }

    if method == Method::CONNECT || secure || hop.always_tunnel {
        let uri = if method == Method::CONNECT {
            authority.parse::<Uri>()
        } else {
            origin_form(target).parse::<Uri>()
        }
        .map_err(|e| PoolError::InvalidRequest(format!("invalid target {}: {}", target, e)))?;

        let connect = method == Method::CONNECT;
        if !connect {
            headers.insert(HOST, host_header(target)?);
        }

        return Ok(RequestArgs {
            method,
            address: hop.address,
            tls: hop.tls,
            tunnel: Some(Tunnel::Connect {
                authority,
                headers: proxy_headers,
            }),
            target_tls: (secure && !connect)
                .then(|| TlsOptions::verified(target_address.host.clone())),
            uri,
            headers,
            timeout,
            registry: registry.clone(),
        });
    }

    for (name, value) in proxy_headers.iter() {
        headers.insert(name.clone(), value.clone());
    }
    let uri = target
        .as_str()
        .parse::<Uri>()
        .map_err(|e| PoolError::InvalidRequest(format!("invalid target {}: {}", target, e)))?;

    Ok(RequestArgs {
        method,
        address: hop.address,
        tls: hop.tls,
        tunnel: None,
        target_tls: None,
        uri,
        headers,
        timeout,
        registry: registry.clone(),
    })
}

pub(crate) fn origin_form(target: &Url) -> String {
    match target.query() {
        Some(query) => format!("{}?{}", target.path(), query),
        None => target.path().to_string(),
    }
}

pub(crate) fn host_header(target: &Url) -> Result<HeaderValue> {
    let host = target.host_str().unwrap_or_default();
    let value = match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    HeaderValue::from_str(&value).map_err(|e| PoolError::InvalidRequest(e.to_string()))
}

pub(crate) fn basic_auth(username: &str, password: &str) -> Result<HeaderValue> {
    let encoded = BASE64.encode(format!("{}:{}", username, password));
    HeaderValue::from_str(&format!("Basic {}", encoded))
        .map_err(|e| PoolError::InvalidRequest(e.to_string()))
}

/// Deserialize a transport-owned JSON payload with a descriptive error.
pub(crate) fn parse_config<T: DeserializeOwned>(value: &Value, what: &str) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| PoolError::Validation(format!("invalid {}: {}", what, e)))
}

pub(crate) fn proxy_config<T: DeserializeOwned>(proxy_config: &Value) -> Result<T> {
    parse_config(proxy_config, "proxy config")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop() -> ProxyHop {
        ProxyHop {
            address: Address::new("10.0.0.1", 3128),
            tls: None,
            authorization: Some(basic_auth("user", "pass").unwrap()),
            extra_headers: HeaderMap::new(),
            always_tunnel: false,
        }
    }

    #[test]
    fn test_http_target_uses_absolute_form() {
        let target = Url::parse("http://example.com/ip?x=1").unwrap();
        let args = forward_proxy_args(
            hop(),
            Method::GET,
            &target,
            HeaderMap::new(),
            &SocketRegistry::new(),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

        assert!(args.tunnel.is_none());
        assert_eq!(args.uri.to_string(), "http://example.com/ip?x=1");
        assert!(args.headers.contains_key(PROXY_AUTHORIZATION));
        assert_eq!(args.address, Address::new("10.0.0.1", 3128));
    }

    #[test]
    fn test_https_target_is_tunnelled() {
        let target = Url::parse("https://example.com/json").unwrap();
        let args = forward_proxy_args(
            hop(),
            Method::GET,
            &target,
            HeaderMap::new(),
            &SocketRegistry::new(),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

        match args.tunnel {
            Some(Tunnel::Connect { authority, headers }) => {
                assert_eq!(authority, "example.com:443");
                assert!(headers.contains_key(PROXY_AUTHORIZATION));
            }
            other => panic!("unexpected tunnel: {:?}", other),
        }
        assert_eq!(args.uri.to_string(), "/json");
        assert!(!args.headers.contains_key(PROXY_AUTHORIZATION));
        assert_eq!(args.headers[HOST], "example.com");
        assert!(args.target_tls.is_some());
    }

    #[test]
    fn test_connect_method_has_no_target_tls() {
        let target = Url::parse("https://example.com:8443").unwrap();
        let args = forward_proxy_args(
            hop(),
            Method::CONNECT,
            &target,
            HeaderMap::new(),
            &SocketRegistry::new(),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

        assert!(args.target_tls.is_none());
        assert_eq!(args.uri.to_string(), "example.com:8443");
    }

    #[test]
    fn test_registry_rejects_duplicate_names() {
        let mut registry = TransportRegistry::with_defaults().unwrap();
        let err = registry.register(Arc::new(GenericTransport)).unwrap_err();
        assert!(matches!(err, PoolError::DuplicateRegistration(_)));
        assert!(registry.get("cloud-local").is_ok());
        assert!(matches!(
            registry.get("carrier-pigeon").err().unwrap(),
            PoolError::TransportNotFound(_)
        ));
    }
}
