use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::connection::{Connection, ConnectionState};
use crate::error::{PoolError, Result};

/// Name-keyed set of live connections that a supervisor can force-close.
#[derive(Clone, Default)]
pub struct SocketRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
pub(crate) struct RegistryInner {
    connections: DashMap<String, Arc<ConnectionState>>,
}

impl RegistryInner {
    /// Remove `name` only if it still points at connection `id`.
    pub(crate) fn remove_entry(&self, name: &str, id: u64) -> bool {
        self.connections
            .remove_if(name, |_, state| state.id == id)
            .is_some()
    }
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `conn` under `name`. Names and connections are both unique.
    pub fn add(&self, name: impl Into<String>, conn: &Connection) -> Result<()> {
        let name = name.into();
        let state = conn.state();

        if let Some(existing) = state.registration_name() {
            return Err(PoolError::DuplicateConnection(format!(
                "connection {} is already registered as '{}'",
                state.id, existing
            )));
        }

        match self.inner.connections.entry(name.clone()) {
            Entry::Occupied(_) => Err(PoolError::DuplicateConnection(format!(
                "name '{}' is already in use",
                name
            ))),
            Entry::Vacant(entry) => {
                entry.insert(state.clone());
                state.set_registration(Arc::downgrade(&self.inner), name);
                Ok(())
            }
        }
    }

    /// Stop tracking `conn`. Returns whether it was registered here.
    pub fn remove(&self, conn: &Connection) -> bool {
        let state = conn.state();
        let Some(name) = state.registration_name() else {
            return false;
        };
        let removed = self.inner.remove_entry(&name, state.id);
        if removed {
            state.clear_registration();
        }
        removed
    }

    /// Force-close every tracked connection. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let names: Vec<String> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut closed = 0;
        for name in names {
            if let Some((_, state)) = self.inner.connections.remove(&name) {
                state.clear_registration();
                state.close();
                closed += 1;
            }
        }

        if closed > 0 {
            debug!(closed, "Closed registered connections");
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::open_connection;
    use crate::net::Address;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn connect_pair() -> (Connection, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        let conn = open_connection(
            Address::new("127.0.0.1", addr.port()),
            Some(Duration::from_secs(5)),
            None,
        )
        .await
        .unwrap();
        (conn, server)
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let registry = SocketRegistry::new();
        let (first, _s1) = connect_pair().await;
        let (second, _s2) = connect_pair().await;

        registry.add("probe", &first).unwrap();
        let err = registry.add("probe", &second).unwrap_err();
        assert!(matches!(err, PoolError::DuplicateConnection(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_same_connection_twice_is_rejected() {
        let registry = SocketRegistry::new();
        let (conn, _server) = connect_pair().await;

        registry.add("a", &conn).unwrap();
        let err = registry.add("b", &conn).unwrap_err();
        assert!(matches!(err, PoolError::DuplicateConnection(_)));
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let registry = SocketRegistry::new();
        let (conn, _server) = connect_pair().await;

        registry.add("short-lived", &conn).unwrap();
        assert_eq!(registry.len(), 1);

        drop(conn);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_allows_reuse_of_name() {
        let registry = SocketRegistry::new();
        let (conn, _server) = connect_pair().await;

        registry.add("probe", &conn).unwrap();
        assert!(registry.remove(&conn));
        assert!(!registry.remove(&conn));
        registry.add("probe", &conn).unwrap();
    }

    #[tokio::test]
    async fn test_close_all_aborts_outstanding_io() {
        let registry = SocketRegistry::new();
        let (mut conn, _server) = connect_pair().await;
        registry.add("tunnel", &conn).unwrap();

        let closer = registry.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            conn.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(closer.close_all(), 1);
        assert!(closer.is_empty());

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_writes() {
        let registry = SocketRegistry::new();
        let (mut conn, _server) = connect_pair().await;
        registry.add("writer", &conn).unwrap();
        registry.close_all();

        assert!(conn.is_closed());
        assert!(conn.write_all(b"late").await.is_err());
    }
}
