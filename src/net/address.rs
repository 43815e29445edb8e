use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Host and port of a TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, including bracketed IPv6 such as `[::1]:8080`.
    pub fn parse(addr: &str) -> Result<Self> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(PoolError::InvalidProxyAddress("empty address".to_string()));
        }

        let url = url::Url::parse(&format!("http://{}", addr)).map_err(|e| {
            PoolError::InvalidProxyAddress(format!("Invalid address '{}': {}", addr, e))
        })?;

        if !(url.path().is_empty() || url.path() == "/")
            || url.query().is_some()
            || !url.username().is_empty()
        {
            return Err(PoolError::InvalidProxyAddress(format!(
                "Invalid address '{}': expected host:port",
                addr
            )));
        }

        let host = url.host_str().ok_or_else(|| {
            PoolError::InvalidProxyAddress(format!("Invalid address '{}': missing host", addr))
        })?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        // Url drops the default port, so read it back from the raw string.
        let port = match url.port() {
            Some(port) => port,
            None if addr.ends_with(":80") => 80,
            None => {
                return Err(PoolError::InvalidProxyAddress(format!(
                    "Invalid address '{}': missing port",
                    addr
                )))
            }
        };

        Ok(Self::new(host, port))
    }

    /// Build from a URL, falling back to the scheme's default port.
    pub fn from_url(url: &url::Url) -> Result<Self> {
        let host = url.host_str().ok_or_else(|| {
            PoolError::InvalidProxyAddress(format!("URL '{}' has no host", url))
        })?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let port = url.port_or_known_default().ok_or_else(|| {
            PoolError::InvalidProxyAddress(format!("URL '{}' has no port", url))
        })?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_missing_port() {
        let err = Address::parse("example.com").unwrap_err();
        assert!(matches!(err, PoolError::InvalidProxyAddress(_)));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("host:notaport").is_err());
        assert!(Address::parse("host:70000").is_err());
        assert!(Address::parse("host:8080/path").is_err());
    }

    #[test]
    fn parse_supports_ipv6() {
        let address = Address::parse("[::1]:8080").unwrap();
        assert_eq!(address.host, "::1");
        assert_eq!(address.port, 8080);
        assert_eq!(address.to_string(), "[::1]:8080");
    }

    #[test]
    fn parse_keeps_default_http_port() {
        let address = Address::parse("gateway.example:80").unwrap();
        assert_eq!(address.port, 80);
    }

    #[test]
    fn from_url_uses_scheme_default() {
        let url = url::Url::parse("https://fingerprint.example/api/json").unwrap();
        assert_eq!(
            Address::from_url(&url).unwrap(),
            Address::new("fingerprint.example", 443)
        );
    }
}
