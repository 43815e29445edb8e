use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::task::AtomicWaker;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant, Sleep};
use tracing::debug;

use super::registry::RegistryInner;
use super::{Address, TlsOptions};
use crate::error::{PoolError, Result};

/// Byte stream usable as a connection or tunnel.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

pub type BoxedStream = Box<dyn IoStream>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Validated parameters of an outbound connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    address: Address,
    timeout: Duration,
    tls: Option<TlsOptions>,
}

impl ConnectOptions {
    /// Fails before any socket exists when the timeout is missing or zero.
    pub fn new(address: Address, timeout: Option<Duration>) -> Result<Self> {
        match timeout {
            Some(timeout) if !timeout.is_zero() => Ok(Self {
                address,
                timeout,
                tls: None,
            }),
            _ => Err(PoolError::MissingTimeout),
        }
    }

    pub fn with_tls(mut self, tls: Option<TlsOptions>) -> Self {
        self.tls = tls;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open the TCP socket and run the optional TLS handshake, both bounded by the timeout.
    pub async fn connect(self) -> Result<Connection> {
        let target = self.address.to_string();
        let timeout = self.timeout;

        let stream = tokio::time::timeout(timeout, async {
            let tcp = TcpStream::connect(&target)
                .await
                .map_err(|e| PoolError::ProxyConnectionFailed(format!("{}: {}", target, e)))?;
            let _ = tcp.set_nodelay(true);

            let stream: BoxedStream = match &self.tls {
                Some(tls) => Box::new(tls.handshake(tcp, &self.address.host).await?),
                None => Box::new(tcp),
            };
            Ok::<_, PoolError>(stream)
        })
        .await
        .map_err(|_| PoolError::Timeout)??;

        debug!(address = %target, tls = self.tls.is_some(), "Connection opened");
        Ok(Connection::wrap(stream, timeout))
    }
}

/// Open a connection to `address`. The timeout is mandatory.
pub async fn open_connection(
    address: Address,
    timeout: Option<Duration>,
    tls: Option<TlsOptions>,
) -> Result<Connection> {
    ConnectOptions::new(address, timeout)?
        .with_tls(tls)
        .connect()
        .await
}

/// Shared between a connection and the registry tracking it.
pub(crate) struct ConnectionState {
    pub(crate) id: u64,
    closed: AtomicBool,
    waker: AtomicWaker,
    registration: Mutex<Option<(Weak<RegistryInner>, String)>>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
            waker: AtomicWaker::new(),
            registration: Mutex::new(None),
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.waker.wake();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn registration_name(&self) -> Option<String> {
        self.registration.lock().as_ref().map(|(_, name)| name.clone())
    }

    pub(crate) fn set_registration(&self, registry: Weak<RegistryInner>, name: String) {
        *self.registration.lock() = Some((registry, name));
    }

    pub(crate) fn clear_registration(&self) {
        self.registration.lock().take();
    }

    /// Remove this connection from whichever registry still tracks it.
    fn deregister(&self) {
        let registration = self.registration.lock().take();
        if let Some((registry, name)) = registration {
            if let Some(registry) = registry.upgrade() {
                registry.remove_entry(&name, self.id);
            }
        }
    }
}

/// Deregisters on drop, whatever state the socket ended in.
struct RegistrationGuard(Arc<ConnectionState>);

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.0.close();
        self.0.deregister();
    }
}

/// Tracked outbound stream with an idle timeout.
///
/// Any read or write pushes the deadline back. Once the deadline passes,
/// or the registry force-closes the connection, the socket is dropped,
/// the registry entry goes away and every further I/O call fails.
pub struct Connection {
    inner: Option<BoxedStream>,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
    guard: RegistrationGuard,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("idle", &self.idle)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub(crate) fn wrap(inner: BoxedStream, idle: Duration) -> Self {
        Self {
            inner: Some(inner),
            idle,
            deadline: Box::pin(sleep(idle)),
            guard: RegistrationGuard(Arc::new(ConnectionState::new())),
        }
    }

    pub fn id(&self) -> u64 {
        self.guard.0.id
    }

    pub fn is_closed(&self) -> bool {
        self.guard.0.is_closed()
    }

    pub(crate) fn state(&self) -> &Arc<ConnectionState> {
        &self.guard.0
    }

    /// Drop the socket and leave the registry. Idempotent.
    fn terminate(&mut self) {
        self.guard.0.close();
        self.guard.0.deregister();
        self.inner.take();
    }

    fn poll_io<T>(
        &mut self,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut dyn IoStream>, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        self.guard.0.waker.register(cx.waker());
        if self.guard.0.is_closed() {
            self.terminate();
            return Poll::Ready(Err(closed_error()));
        }
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(Err(closed_error()));
        };

        match op(Pin::new(&mut **inner), cx) {
            Poll::Ready(result) => {
                let next = Instant::now() + self.idle;
                self.deadline.as_mut().reset(next);
                Poll::Ready(result)
            }
            Poll::Pending => {
                if self.deadline.as_mut().poll(cx).is_ready() {
                    debug!(connection = self.id(), "Idle timeout, closing connection");
                    self.terminate();
                    return Poll::Ready(Err(timed_out_error()));
                }
                Poll::Pending
            }
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

fn timed_out_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection idle timeout")
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().poll_io(cx, |inner, cx| inner.poll_read(cx, buf))
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().poll_io(cx, |inner, cx| inner.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_io(cx, |inner, cx| inner.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(inner) => Pin::new(&mut **inner).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SocketRegistry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_zero_timeout_is_rejected_before_connecting() {
        let err = ConnectOptions::new(Address::new("127.0.0.1", 9), Some(Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, PoolError::MissingTimeout));
    }

    #[test]
    fn test_missing_timeout_is_rejected_before_connecting() {
        let err = ConnectOptions::new(Address::new("127.0.0.1", 9), None).unwrap_err();
        assert!(matches!(err, PoolError::MissingTimeout));
    }

    #[tokio::test]
    async fn test_open_connection_without_timeout_opens_no_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let err = open_connection(Address::new("127.0.0.1", addr.port()), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::MissingTimeout));

        let accepted =
            tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "no socket should have been opened");
    }

    #[tokio::test]
    async fn test_connection_round_trips_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut conn = open_connection(
            Address::new("127.0.0.1", addr.port()),
            Some(Duration::from_secs(2)),
            None,
        )
        .await
        .unwrap();

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_idle_connection_is_force_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let mut conn = open_connection(
            Address::new("127.0.0.1", addr.port()),
            Some(Duration::from_millis(100)),
            None,
        )
        .await
        .unwrap();

        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(conn.is_closed());
        server.abort();
    }

    #[tokio::test]
    async fn test_idle_timeout_drops_socket_and_registry_entry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1];
            // EOF arrives once the client side drops its socket
            stream.read(&mut buf).await.unwrap()
        });

        let registry = SocketRegistry::new();
        let mut conn = open_connection(
            Address::new("127.0.0.1", addr.port()),
            Some(Duration::from_millis(100)),
            None,
        )
        .await
        .unwrap();
        registry.add("upstream", &conn).unwrap();
        assert_eq!(registry.len(), 1);

        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(registry.len(), 0);

        let read = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);

        let err = conn.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        drop(conn);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = open_connection(
            Address::new("127.0.0.1", port),
            Some(Duration::from_secs(1)),
            None,
        )
        .await;
        assert!(result.is_err());
    }
}
