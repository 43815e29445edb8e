use std::time::Duration;

use bytes::Bytes;
use http::header::HOST;
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use super::connection::{BoxedStream, ConnectOptions};
use super::{Address, SocketRegistry, TlsOptions};
use crate::error::{PoolError, Result};

const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// How the target is reached once the ingress socket is open.
#[derive(Debug, Clone)]
pub enum Tunnel {
    /// HTTP `CONNECT authority` with extra request headers.
    Connect {
        authority: String,
        headers: HeaderMap,
    },
    /// SOCKS5 handshake, optionally with username/password.
    Socks5 {
        target: Address,
        credentials: Option<(String, String)>,
    },
}

/// Physical request arguments produced by a transport.
#[derive(Clone)]
pub struct RequestArgs {
    pub method: Method,
    /// Endpoint the socket is opened to: a proxy ingress or the target itself
    pub address: Address,
    /// TLS towards `address`
    pub tls: Option<TlsOptions>,
    pub tunnel: Option<Tunnel>,
    /// TLS towards the final target, negotiated inside the tunnel
    pub target_tls: Option<TlsOptions>,
    /// Request target: absolute-form through forward proxies, origin-form otherwise
    pub uri: Uri,
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
    /// Registry every opened socket is tracked in
    pub registry: SocketRegistry,
}

impl std::fmt::Debug for RequestArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestArgs")
            .field("method", &self.method)
            .field("address", &self.address)
            .field("tls", &self.tls.is_some())
            .field("tunnel", &self.tunnel)
            .field("target_tls", &self.target_tls.is_some())
            .field("uri", &self.uri)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Open the socket described by `args` and run every handshake it needs.
///
/// The returned stream is ready for an HTTP exchange or raw tunnel bytes.
pub async fn establish(args: &RequestArgs, label: &str) -> Result<BoxedStream> {
    let options = ConnectOptions::new(args.address.clone(), args.timeout)?.with_tls(args.tls.clone());
    let timeout = options.timeout();

    let connection = options.connect().await?;
    args.registry
        .add(format!("{}#{}", label, connection.id()), &connection)?;

    let mut stream: BoxedStream = Box::new(connection);

    stream = match &args.tunnel {
        Some(Tunnel::Connect { authority, headers }) => {
            tokio::time::timeout(timeout, connect_tunnel(&mut stream, authority, headers))
                .await
                .map_err(|_| PoolError::Timeout)??;
            stream
        }
        Some(Tunnel::Socks5 {
            target,
            credentials,
        }) => tokio::time::timeout(timeout, socks5_tunnel(stream, target, credentials.as_ref()))
            .await
            .map_err(|_| PoolError::Timeout)??,
        None => stream,
    };

    if let Some(tls) = &args.target_tls {
        let host = args.uri.host().unwrap_or(&args.address.host).to_string();
        let secured = tokio::time::timeout(timeout, tls.handshake(stream, &host))
            .await
            .map_err(|_| PoolError::Timeout)??;
        stream = Box::new(secured);
    }

    Ok(stream)
}

async fn connect_tunnel(
    stream: &mut BoxedStream,
    authority: &str,
    headers: &HeaderMap,
) -> Result<()> {
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);
    for (name, value) in headers {
        let value = value
            .to_str()
            .map_err(|_| PoolError::InvalidRequest(format!("header {} is not ASCII", name)))?;
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read byte by byte so no tunnel payload is consumed with the headers.
    let mut response = Vec::with_capacity(256);
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_CONNECT_RESPONSE {
            return Err(PoolError::ConnectFailed("response headers too large".into()));
        }
        match stream.read_u8().await {
            Ok(byte) => response.push(byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(PoolError::ConnectFailed("empty CONNECT response".into()))
            }
            Err(e) => return Err(e.into()),
        }
    }

    let response = String::from_utf8_lossy(&response);
    let status_line = response.lines().next().unwrap_or_default();
    if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
        return Err(PoolError::ConnectFailed(status_line.to_string()));
    }

    debug!(authority, "CONNECT tunnel established");
    Ok(())
}

async fn socks5_tunnel(
    stream: BoxedStream,
    target: &Address,
    credentials: Option<&(String, String)>,
) -> Result<BoxedStream> {
    let target_addr = (target.host.as_str(), target.port);
    let socks = match credentials {
        Some((username, password)) => {
            Socks5Stream::connect_with_password_and_socket(stream, target_addr, username, password)
                .await
        }
        None => Socks5Stream::connect_with_socket(stream, target_addr).await,
    }
    .map_err(|e| PoolError::ConnectFailed(format!("SOCKS5 handshake failed: {}", e)))?;

    Ok(Box::new(socks.into_inner()))
}

/// Send one HTTP/1.1 request described by `args` and buffer the response.
pub async fn send_request(args: &RequestArgs, body: Bytes, label: &str) -> Result<HttpResponse> {
    let stream = establish(args, label).await?;
    let timeout = args.timeout.ok_or(PoolError::MissingTimeout)?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| PoolError::ProxyConnectionFailed(format!("Handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Connection ended: {}", e);
        }
    });

    let mut request = Request::builder()
        .method(args.method.clone())
        .uri(args.uri.clone())
        .body(Full::new(body))?;
    *request.headers_mut() = args.headers.clone();
    if !request.headers().contains_key(HOST) {
        if let Some(authority) = args.uri.authority() {
            let host = HeaderValue::from_str(authority.as_str())
                .map_err(|e| PoolError::InvalidRequest(e.to_string()))?;
            request.headers_mut().insert(HOST, host);
        }
    }

    let response = tokio::time::timeout(timeout, sender.send_request(request))
        .await
        .map_err(|_| PoolError::Timeout)?
        .map_err(|e| PoolError::ProxyConnectionFailed(format!("Request failed: {}", e)))?;

    let (parts, body) = response.into_parts();
    let body = tokio::time::timeout(timeout, body.collect())
        .await
        .map_err(|_| PoolError::Timeout)?
        .map_err(|e| PoolError::ProxyConnectionFailed(format!("Failed to read response: {}", e)))?
        .to_bytes();

    Ok(HttpResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    })
}
