use std::time::Duration;

use http::header::HOST;
use http::{HeaderMap, Method, Uri};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{
    basic_auth, forward_proxy_args, host_header, origin_form, proxy_config, ProxyHop, Transport,
    TransportCategory,
};
use crate::error::{PoolError, Result};
use crate::models::{Connector, Proxy};
use crate::net::{Address, RequestArgs, SocketRegistry, TlsOptions, Tunnel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

/// A user supplied proxy URL, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyUrl {
    pub scheme: ProxyScheme,
    pub address: Address,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| PoolError::Validation(format!("invalid proxy URL '{}': {}", raw, e)))?;

        let scheme = match url.scheme() {
            "http" => ProxyScheme::Http,
            "https" => ProxyScheme::Https,
            "socks5" | "socks5h" => ProxyScheme::Socks5,
            other => {
                return Err(PoolError::Validation(format!(
                    "unsupported proxy scheme '{}'",
                    other
                )))
            }
        };
        if url.port().is_none() && scheme == ProxyScheme::Socks5 {
            return Err(PoolError::Validation(format!(
                "proxy URL '{}' must include a port",
                raw
            )));
        }

        let username = (!url.username().is_empty()).then(|| url.username().to_string());
        Ok(Self {
            scheme,
            address: Address::from_url(&url)?,
            username,
            password: url.password().map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericProxyConfig {
    pub url: String,
}

/// Any HTTP, HTTPS or SOCKS5 proxy given by URL.
pub struct GenericTransport;

impl Transport for GenericTransport {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn category(&self) -> TransportCategory {
        TransportCategory::GenericProxy
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
        let config: GenericProxyConfig = proxy_config(proxy_config_value)?;
        let proxy = ProxyUrl::parse(&config.url)?;

        if proxy.scheme == ProxyScheme::Socks5 {
            let target_address = Address::from_url(target)?;
            let secure = target.scheme() == "https";
            let uri = if method == Method::CONNECT {
                target_address.to_string()
            } else {
                headers.insert(HOST, host_header(target)?);
                origin_form(target)
            }
            .parse::<Uri>()
            .map_err(|e| PoolError::InvalidRequest(format!("invalid target {}: {}", target, e)))?;

            let credentials = proxy
                .username
                .clone()
                .map(|username| (username, proxy.password.clone().unwrap_or_default()));

            return Ok(RequestArgs {
                target_tls: (secure && method != Method::CONNECT)
                    .then(|| TlsOptions::verified(target_address.host.clone())),
                method,
                address: proxy.address,
                tls: None,
                tunnel: Some(Tunnel::Socks5 {
                    target: target_address,
                    credentials,
                }),
                uri,
                headers,
                timeout,
                registry: registry.clone(),
            });
        }

        let authorization = match &proxy.username {
            Some(username) => Some(basic_auth(
                username,
                proxy.password.as_deref().unwrap_or_default(),
            )?),
            None => None,
        };
        let tls = (proxy.scheme == ProxyScheme::Https).then(|| TlsOptions {
            server_name: Some(proxy.address.host.clone()),
            ..TlsOptions::default()
        });

        let hop = ProxyHop {
            address: proxy.address,
            tls,
            authorization,
            extra_headers: HeaderMap::new(),
            always_tunnel: false,
        };
        forward_proxy_args(hop, method, target, headers, registry, timeout)
    }

    fn complete_proxy_config(&self, proxy: &mut Proxy, _connector: &Connector) -> Result<()> {
        ProxyUrl::parse(&proxy.key)?;
        proxy.config = Some(serde_json::to_value(GenericProxyConfig {
            url: proxy.key.clone(),
        })?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_proxy_urls() {
        let http = ProxyUrl::parse("http://u:p@10.0.0.1:8080").unwrap();
        assert_eq!(http.scheme, ProxyScheme::Http);
        assert_eq!(http.address, Address::new("10.0.0.1", 8080));
        assert_eq!(http.username.as_deref(), Some("u"));
        assert_eq!(http.password.as_deref(), Some("p"));

        let socks = ProxyUrl::parse("socks5://[::1]:1080").unwrap();
        assert_eq!(socks.scheme, ProxyScheme::Socks5);
        assert_eq!(socks.address.host, "::1");

        assert!(ProxyUrl::parse("ftp://10.0.0.1:21").is_err());
        assert!(ProxyUrl::parse("socks5://10.0.0.1").is_err());
        assert!(ProxyUrl::parse("10.0.0.1:8080").is_err());
    }

    #[test]
    fn test_socks5_builds_socks_tunnel() {
        let args = GenericTransport
            .build_request_args(
                Method::GET,
                &Url::parse("http://example.com/ip").unwrap(),
                HeaderMap::new(),
                &json!({ "url": "socks5://u:p@10.0.0.2:1080" }),
                &SocketRegistry::new(),
                Some(Duration::from_secs(2)),
            )
            .unwrap();

        match args.tunnel {
            Some(Tunnel::Socks5 {
                target,
                credentials,
            }) => {
                assert_eq!(target, Address::new("example.com", 80));
                assert_eq!(credentials, Some(("u".to_string(), "p".to_string())));
            }
            other => panic!("expected SOCKS5 tunnel, got {:?}", other),
        }
        assert_eq!(args.uri.to_string(), "/ip");
        assert_eq!(args.headers[HOST], "example.com");
        assert!(args.target_tls.is_none());
    }
}
