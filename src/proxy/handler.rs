//! Relay request handler with retry logic
//!
//! Forwards CONNECT tunnels and absolute-form HTTP requests through a
//! `Started` proxy of the pool, using the transport of the proxy's provider.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::connectors::ConnectorRegistry;
use crate::error::{PoolError, Result};
use crate::models::{now_ms, Proxy};
use crate::net::{self, BoxedStream, HttpResponse, RequestArgs, SocketRegistry};
use crate::proxy::selector::ProxySelector;
use crate::proxy::tunnel::{copy_bidirectional, RelayGuard};
use crate::services::ProjectActivity;
use crate::transports::TransportRegistry;

const SOCKET_LABEL: &str = "relay";

/// Configuration for the relay handler
#[derive(Debug, Clone)]
pub struct RelayHandlerConfig {
    /// Additional proxies tried after the first one fails
    pub max_retries: u32,
    /// Timeout for reaching the target through a proxy
    pub connect_timeout: Duration,
    /// Timeout for the request exchange, also the idle timeout of tunnels
    pub request_timeout: Duration,
}

impl Default for RelayHandlerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Relay request handler
pub struct RelayHandler {
    selector: Arc<dyn ProxySelector>,
    connectors: ConnectorRegistry,
    transports: TransportRegistry,
    config: RelayHandlerConfig,
    sockets: SocketRegistry,
    activity: Option<ProjectActivity>,
}

impl RelayHandler {
    pub fn new(
        selector: Arc<dyn ProxySelector>,
        connectors: ConnectorRegistry,
        transports: TransportRegistry,
        config: RelayHandlerConfig,
    ) -> Self {
        Self {
            selector,
            connectors,
            transports,
            config,
            sockets: SocketRegistry::new(),
            activity: None,
        }
    }

    /// Record relayed traffic per project
    pub fn set_activity(&mut self, activity: ProjectActivity) {
        self.activity = Some(activity);
    }

    fn record_activity(&self, proxy: &Proxy) {
        if let Some(activity) = &self.activity {
            activity.record(proxy.project_id, now_ms());
        }
    }

    /// Every outbound socket the relay currently holds
    pub fn sockets(&self) -> &SocketRegistry {
        &self.sockets
    }

    /// Handle an incoming relay request
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_ip: String,
    ) -> Result<Response<Full<Bytes>>> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req, client_ip).await;
        }
        self.handle_http(req, client_ip).await
    }

    /// Physical request arguments for `target` through `proxy`.
    fn request_args(
        &self,
        proxy: &Proxy,
        method: Method,
        target: &Url,
        headers: HeaderMap,
    ) -> Result<RequestArgs> {
        let provider = self.connectors.get(&proxy.provider)?;
        let transport = self.transports.get(provider.transport())?;
        let config = proxy
            .config
            .as_ref()
            .ok_or_else(|| PoolError::ProxyConnectionFailed(format!("proxy {} has no config", proxy.id)))?;

        transport.build_request_args(
            method,
            target,
            headers,
            config,
            &self.sockets,
            Some(self.config.request_timeout),
        )
    }

    /// Pick the next proxy not tried yet. `None` ends the retry loop.
    async fn next_proxy(&self, tried: &HashSet<Uuid>) -> Option<Arc<Proxy>> {
        match self.selector.select(tried).await {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                debug!("No further proxy to try: {}", e);
                None
            }
        }
    }

    /// Handle HTTP CONNECT request (HTTPS tunneling)
    #[instrument(skip(self, req), fields(uri = %req.uri()))]
    async fn handle_connect(
        &self,
        req: Request<Incoming>,
        client_ip: String,
    ) -> Result<Response<Full<Bytes>>> {
        let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                "CONNECT requires an authority",
            ));
        };
        let target = Url::parse(&format!("https://{}", authority))
            .map_err(|e| PoolError::InvalidRequest(format!("invalid CONNECT target {}: {}", authority, e)))?;

        debug!("CONNECT request to {} from {}", authority, client_ip);

        let max_attempts = self.config.max_retries + 1;
        let mut tried = HashSet::new();
        let mut last_error = None;
        let mut selected: Option<(Arc<Proxy>, BoxedStream)> = None;

        while (tried.len() as u32) < max_attempts {
            let Some(proxy) = self.next_proxy(&tried).await else {
                break;
            };
            tried.insert(proxy.id);

            debug!(
                "Attempting CONNECT through proxy {} (attempt {}/{})",
                proxy.name,
                tried.len(),
                max_attempts
            );

            let attempt_start = Instant::now();
            let attempt = async {
                let args = self.request_args(&proxy, Method::CONNECT, &target, HeaderMap::new())?;
                tokio::time::timeout(
                    self.config.connect_timeout,
                    net::establish(&args, SOCKET_LABEL),
                )
                .await
                .map_err(|_| PoolError::Timeout)?
            };

            let result = attempt.await;
            match result {
                Ok(stream) => {
                    info!(
                        proxy_id = %proxy.id,
                        elapsed_ms = attempt_start.elapsed().as_millis() as u64,
                        "CONNECT tunnel established through {} to {}",
                        proxy.name,
                        authority
                    );
                    self.record_activity(&proxy);
                    selected = Some((proxy, stream));
                    break;
                }
                Err(e) => {
                    warn!(
                        proxy_id = %proxy.id,
                        "CONNECT through {} failed: {} (attempt {}/{})",
                        proxy.name,
                        e,
                        tried.len(),
                        max_attempts
                    );
                    last_error = Some(e);
                }
            }
        }

        let Some((proxy, server)) = selected else {
            return Ok(self.exhausted_response(tried.len(), last_error));
        };

        let on_upgrade: OnUpgrade = hyper::upgrade::on(req);
        let guard = RelayGuard::new(proxy.id, self.selector.clone());

        tokio::spawn(async move {
            let _guard = guard;
            match on_upgrade.await {
                Ok(upgraded) => {
                    copy_bidirectional(TokioIo::new(upgraded), server).await;
                }
                Err(e) => {
                    debug!("CONNECT upgrade failed: {}", e);
                }
            }
        });

        Ok(Response::new(Full::new(Bytes::new())))
    }

    /// Handle an absolute-form HTTP request
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    async fn handle_http(
        &self,
        req: Request<Incoming>,
        client_ip: String,
    ) -> Result<Response<Full<Bytes>>> {
        if req.uri().scheme().is_none() || req.uri().host().is_none() {
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                "Relay requires absolute-form request targets",
            ));
        }
        let target = Url::parse(&req.uri().to_string())
            .map_err(|e| PoolError::InvalidRequest(format!("invalid target {}: {}", req.uri(), e)))?;

        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| PoolError::InvalidRequest(format!("Failed to read body: {}", e)))?
            .to_bytes();
        let headers = strip_hop_by_hop(&parts.headers);

        debug!("{} {} from {}", parts.method, target, client_ip);

        let max_attempts = self.config.max_retries + 1;
        let mut tried = HashSet::new();
        let mut last_error = None;

        while (tried.len() as u32) < max_attempts {
            let Some(proxy) = self.next_proxy(&tried).await else {
                break;
            };
            tried.insert(proxy.id);
            let _guard = RelayGuard::new(proxy.id, self.selector.clone());

            debug!(
                "Forwarding request through proxy {} (attempt {}/{})",
                proxy.name,
                tried.len(),
                max_attempts
            );

            let attempt = async {
                let args =
                    self.request_args(&proxy, parts.method.clone(), &target, headers.clone())?;
                net::send_request(&args, body_bytes.clone(), SOCKET_LABEL).await
            };

            let result = attempt.await;
            match result {
                Ok(response) => {
                    debug!(
                        proxy_id = %proxy.id,
                        status = response.status.as_u16(),
                        "Request relayed through {}",
                        proxy.name
                    );
                    self.record_activity(&proxy);
                    return Ok(relayed_response(response));
                }
                Err(e) => {
                    warn!(
                        proxy_id = %proxy.id,
                        "Request through {} failed: {} (attempt {}/{})",
                        proxy.name,
                        e,
                        tried.len(),
                        max_attempts
                    );
                    last_error = Some(e);
                }
            }
        }

        Ok(self.exhausted_response(tried.len(), last_error))
    }

    fn exhausted_response(&self, attempts: usize, last_error: Option<PoolError>) -> Response<Full<Bytes>> {
        match last_error {
            None => {
                error!("No proxies available for relaying");
                error_response(StatusCode::SERVICE_UNAVAILABLE, "No proxies available")
            }
            Some(e) => {
                error!("All relay attempts failed after {} attempts", attempts);
                let exhausted = PoolError::AllProxiesExhausted {
                    attempts: attempts as u32,
                };
                error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("{}: {}", exhausted, e),
                )
            }
        }
    }
}

/// Create a plain-text error response
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn relayed_response(upstream: HttpResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = strip_hop_by_hop(&upstream.headers);
    response
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop_header(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
