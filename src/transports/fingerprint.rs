use std::time::Duration;

use bytes::Bytes;
use http::header::{LOCATION, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use super::Transport;
use crate::config::FingerprintConfig;
use crate::error::{PoolError, Result};
use crate::models::Fingerprint;
use crate::net::{send_request, SocketRegistry};

/// How the fingerprint endpoint is queried.
#[derive(Debug, Clone)]
pub struct FingerprintOptions {
    pub url: Url,
    pub timeout: Duration,
    pub follow_redirect_max: u32,
    pub retry_max: u32,
    pub useragent: String,
}

impl From<&FingerprintConfig> for FingerprintOptions {
    fn from(config: &FingerprintConfig) -> Self {
        Self {
            url: config.url.clone(),
            timeout: config.timeout,
            follow_redirect_max: config.follow_redirect_max,
            retry_max: config.retry_max,
            useragent: config.useragent.clone(),
        }
    }
}

/// Who is asking, reported to the fingerprint endpoint as query parameters.
#[derive(Debug, Clone)]
pub struct FingerprintRequest {
    /// `connector` for managed proxies, `freeproxy` for free proxy records
    pub mode: &'static str,
    pub connector_type: String,
    pub proxy_id: String,
}

enum Attempt {
    Done(Fingerprint),
    Redirect(Url),
}

/// Discovers the egress identity of a proxy by calling the fingerprint
/// endpoint through it.
#[derive(Debug, Clone)]
pub struct FingerprintProbe {
    options: FingerprintOptions,
}

impl FingerprintProbe {
    pub fn new(options: FingerprintOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &FingerprintOptions {
        &self.options
    }

    /// Redirects are followed up to `follow_redirect_max` times and failed
    /// attempts are retried up to `retry_max` times. Every socket opened is
    /// tracked in `registry`.
    #[instrument(skip(self, transport, proxy_config, registry), fields(transport = transport.name()))]
    pub async fn probe(
        &self,
        transport: &dyn Transport,
        proxy_config: &Value,
        request: &FingerprintRequest,
        registry: &SocketRegistry,
    ) -> Result<Fingerprint> {
        let mut url = self.options.url.clone();
        let mut redirects_left = self.options.follow_redirect_max;
        let mut retries_left = self.options.retry_max;

        loop {
            match self
                .attempt(transport, proxy_config, request, registry, &url)
                .await
            {
                Ok(Attempt::Done(fingerprint)) => return Ok(fingerprint),
                Ok(Attempt::Redirect(location)) => {
                    if location == url {
                        return Err(PoolError::Fingerprint(
                            "Cannot redirect to same location".to_string(),
                        ));
                    }
                    if redirects_left == 0 {
                        return Err(PoolError::Fingerprint("Too many redirects".to_string()));
                    }
                    redirects_left -= 1;
                    debug!(%location, "Following fingerprint redirect");
                    url = location;
                }
                Err(e) if retries_left > 0 => {
                    retries_left -= 1;
                    debug!(error = %e, retries_left, "Fingerprint attempt failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        transport: &dyn Transport,
        proxy_config: &Value,
        request: &FingerprintRequest,
        registry: &SocketRegistry,
        url: &Url,
    ) -> Result<Attempt> {
        let mut target = url.clone();
        target
            .query_pairs_mut()
            .append_pair("mode", request.mode)
            .append_pair("connectorType", &request.connector_type)
            .append_pair("proxyId", &request.proxy_id);

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.options.useragent)
                .map_err(|e| PoolError::InvalidConfig(format!("invalid user agent: {}", e)))?,
        );

        let args = transport.build_request_args(
            Method::GET,
            &target,
            headers,
            proxy_config,
            registry,
            Some(self.options.timeout),
        )?;
        let label = format!("fingerprint:{}", request.proxy_id);
        let response = send_request(&args, Bytes::new(), &label).await?;

        if response.status.is_redirection() && response.status != StatusCode::NOT_MODIFIED {
            if let Some(location) = response
                .headers
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
            {
                let location = url.join(location).map_err(|e| {
                    PoolError::Fingerprint(format!("invalid redirect '{}': {}", location, e))
                })?;
                return Ok(Attempt::Redirect(location));
            }
        }

        if response.status != StatusCode::OK {
            return Err(PoolError::Fingerprint(format!(
                "Get {} status code: {}",
                response.status.as_u16(),
                String::from_utf8_lossy(&response.body)
            )));
        }

        let fingerprint = serde_json::from_slice(&response.body)
            .map_err(|e| PoolError::Fingerprint(format!("invalid fingerprint body: {}", e)))?;
        Ok(Attempt::Done(fingerprint))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Connector, Proxy, FINGERPRINT_HEADER};
    use crate::net::tls::parse_certificate;
    use crate::transports::cloud::tests::test_certificate;
    use crate::transports::{CloudTransport, DatacenterTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    pub(crate) fn options(url: &str) -> FingerprintOptions {
        FingerprintOptions {
            url: Url::parse(url).unwrap(),
            timeout: Duration::from_secs(2),
            follow_redirect_max: 3,
            retry_max: 2,
            useragent: "relaypool-test".to_string(),
        }
    }

    fn request() -> FingerprintRequest {
        FingerprintRequest {
            mode: "connector",
            connector_type: "datacenter-local".to_string(),
            proxy_id: "proxy-1".to_string(),
        }
    }

    /// Read request headers up to the blank line.
    async fn read_head<S: AsyncRead + Unpin>(reader: &mut BufReader<S>) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let line = line.trim_end().to_string();
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }
        lines
    }

    async fn respond<S: AsyncWrite + Unpin>(stream: &mut S, status: &str, extra: &str, body: &str) {
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
            status,
            body.len(),
            extra,
            body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
    }

    /// Plain HTTP forward proxy answering every request with `handler`.
    pub(crate) async fn forward_proxy<F>(handler: F) -> u16
    where
        F: Fn(usize, &[String]) -> (String, String, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler = Arc::new(handler);
        let counter = Arc::new(AtomicUsize::new(0));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                let n = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    let head = read_head(&mut reader).await;
                    let (status, extra, body) = handler(n, &head);
                    respond(reader.get_mut(), &status, &extra, &body).await;
                });
            }
        });
        port
    }

    fn datacenter_config(port: u16) -> Value {
        json!({ "address": format!("127.0.0.1:{}", port) })
    }

    #[tokio::test]
    async fn test_probe_parses_fingerprint_and_sends_query() {
        let port = forward_proxy(|_, head| {
            assert!(head[0].starts_with("GET http://fingerprint.test/json?"));
            assert!(head[0].contains("mode=connector"));
            assert!(head[0].contains("connectorType=datacenter-local"));
            assert!(head[0].contains("proxyId=proxy-1"));
            assert!(head
                .iter()
                .any(|line| line.to_lowercase() == "user-agent: relaypool-test"));
            (
                "200 OK".to_string(),
                String::new(),
                r#"{"ip":"9.9.9.9","countryCode":"nl"}"#.to_string(),
            )
        })
        .await;

        let probe = FingerprintProbe::new(options("http://fingerprint.test/json"));
        let fingerprint = probe
            .probe(
                &DatacenterTransport,
                &datacenter_config(port),
                &request(),
                &SocketRegistry::new(),
            )
            .await
            .unwrap();

        assert_eq!(fingerprint.ip, "9.9.9.9");
        assert_eq!(fingerprint.country_code.as_deref(), Some("nl"));
    }

    #[tokio::test]
    async fn test_non_200_reports_status_and_body() {
        let port = forward_proxy(|_, _| {
            (
                "503 Service Unavailable".to_string(),
                String::new(),
                "busy".to_string(),
            )
        })
        .await;

        let mut opts = options("http://fingerprint.test/json");
        opts.retry_max = 0;
        let err = FingerprintProbe::new(opts)
            .probe(
                &DatacenterTransport,
                &datacenter_config(port),
                &request(),
                &SocketRegistry::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Fingerprint failed: Get 503 status code: busy");
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let port = forward_proxy(|n, _| {
            if n < 2 {
                ("500 Internal Server Error".to_string(), String::new(), "oops".to_string())
            } else {
                ("200 OK".to_string(), String::new(), r#"{"ip":"2.2.2.2"}"#.to_string())
            }
        })
        .await;

        let fingerprint = FingerprintProbe::new(options("http://fingerprint.test/json"))
            .probe(
                &DatacenterTransport,
                &datacenter_config(port),
                &request(),
                &SocketRegistry::new(),
            )
            .await
            .unwrap();
        assert_eq!(fingerprint.ip, "2.2.2.2");
    }

    #[tokio::test]
    async fn test_redirect_loop_is_bounded() {
        let port = forward_proxy(|n, _| {
            (
                "302 Found".to_string(),
                format!("Location: http://fingerprint.test/hop{}\r\n", n),
                String::new(),
            )
        })
        .await;

        let err = FingerprintProbe::new(options("http://fingerprint.test/json"))
            .probe(
                &DatacenterTransport,
                &datacenter_config(port),
                &request(),
                &SocketRegistry::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Too many redirects"));
    }

    #[tokio::test]
    async fn test_redirect_to_same_location_fails() {
        let port = forward_proxy(|_, _| {
            (
                "301 Moved Permanently".to_string(),
                "Location: http://fingerprint.test/json\r\n".to_string(),
                String::new(),
            )
        })
        .await;

        let err = FingerprintProbe::new(options("http://fingerprint.test/json"))
            .probe(
                &DatacenterTransport,
                &datacenter_config(port),
                &request(),
                &SocketRegistry::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("same location"));
    }

    /// Mutual TLS ingress that tunnels to a fingerprint endpoint echoing the
    /// forced fingerprint header back as JSON.
    async fn cloud_ingress() -> u16 {
        let (chain, key) = parse_certificate(&test_certificate()).unwrap();
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let tls = acceptor.accept(stream).await.unwrap();
            let mut reader = BufReader::new(tls);

            let connect = read_head(&mut reader).await;
            assert_eq!(connect[0], "CONNECT fingerprint.test:80 HTTP/1.1");
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();

            let head = read_head(&mut reader).await;
            let header = head
                .iter()
                .find_map(|line| {
                    line.to_lowercase()
                        .starts_with(&format!("{}:", FINGERPRINT_HEADER))
                        .then(|| line[FINGERPRINT_HEADER.len() + 1..].trim().to_string())
                })
                .unwrap();
            let fingerprint = Fingerprint::from_header_value(&header).unwrap();
            let body = serde_json::to_string(&fingerprint).unwrap();
            respond(reader.get_mut(), "200 OK", "", &body).await;
        });
        port
    }

    #[tokio::test]
    async fn test_cloud_local_probe_reports_forced_fingerprint() {
        let port = cloud_ingress().await;

        let mut connector = Connector::new(
            Uuid::new_v4(),
            "local",
            "datacenter-local",
            json!({}),
            json!({ "region": "europe" }),
            1,
            0,
        );
        connector.certificate = Some(test_certificate());
        let mut proxy = Proxy::to_create(connector.project_id, connector.id, "datacenter-local", 0);
        proxy.config = Some(json!({ "address": format!("127.0.0.1:{}", port) }));

        let transport = CloudTransport::local();
        transport
            .complete_proxy_config(&mut proxy, &connector)
            .unwrap();

        let registry = SocketRegistry::new();
        let mut opts = options("http://fingerprint.test/json");
        opts.retry_max = 0;
        let fingerprint = FingerprintProbe::new(opts)
            .probe(&transport, proxy.config.as_ref().unwrap(), &request(), &registry)
            .await
            .unwrap();

        assert_eq!(fingerprint.ip, "1.1.1.1");
        assert_eq!(fingerprint.continent_name.as_deref(), Some("europe"));
        registry.close_all();
        assert!(registry.is_empty());
    }
}
