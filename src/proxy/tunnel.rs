//! CONNECT tunnel plumbing for the relay
//!
//! Moves bytes between the upgraded client connection and the stream
//! established through the selected proxy.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::proxy::selector::ProxySelector;

/// Copy data bidirectionally between two streams until both sides finish.
///
/// Returns the bytes sent client to server and server to client.
#[instrument(skip(client, server))]
pub async fn copy_bidirectional<C, S>(client: C, server: S) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let client_to_server = async {
        let result = tokio::io::copy(&mut client_read, &mut server_write).await;
        let _ = server_write.shutdown().await;
        result
    };

    let server_to_client = async {
        let result = tokio::io::copy(&mut server_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (sent, received) = tokio::join!(client_to_server, server_to_client);

    let bytes_sent = sent.unwrap_or_else(|e| {
        debug!("Client to server copy ended: {}", e);
        0
    });
    let bytes_received = received.unwrap_or_else(|e| {
        debug!("Server to client copy ended: {}", e);
        0
    });

    debug!(bytes_sent, bytes_received, "Tunnel closed");
    (bytes_sent, bytes_received)
}

/// Counts a relayed connection against its proxy for as long as it lives.
pub struct RelayGuard {
    proxy_id: Uuid,
    selector: Arc<dyn ProxySelector>,
}

impl RelayGuard {
    pub fn new(proxy_id: Uuid, selector: Arc<dyn ProxySelector>) -> Self {
        selector.acquire(proxy_id);
        Self { proxy_id, selector }
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.selector.release(self.proxy_id);
    }
}
