//! Relay proxy selection
//!
//! The relay forwards through `Started` proxies picked in round-robin order.
//! The set is replaced wholesale after every probe round.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{PoolError, Result};
use crate::models::Proxy;

/// Trait for proxy selection strategies
#[async_trait]
pub trait ProxySelector: Send + Sync {
    /// Select a proxy whose id is not in `exclude`
    ///
    /// Returns an error if no proxies are available
    async fn select(&self, exclude: &HashSet<Uuid>) -> Result<Arc<Proxy>>;

    /// Replace the internal proxy list
    async fn refresh(&self, proxies: Vec<Proxy>) -> Result<()>;

    fn available_count(&self) -> usize;

    fn strategy_name(&self) -> &'static str;

    /// Mark a proxy as being used (for connection tracking)
    fn acquire(&self, proxy_id: Uuid);

    /// Mark a proxy as no longer being used
    fn release(&self, proxy_id: Uuid);

    /// Relayed connections currently open
    fn in_flight(&self) -> usize;
}

/// Open relayed connections per proxy
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    connections: DashMap<Uuid, usize>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, proxy_id: Uuid) {
        self.connections
            .entry(proxy_id)
            .and_modify(|c| *c += 1)
            .or_insert(1);
    }

    pub fn release(&self, proxy_id: Uuid) {
        self.connections.entry(proxy_id).and_modify(|c| {
            if *c > 0 {
                *c -= 1;
            }
        });
    }

    pub fn get(&self, proxy_id: Uuid) -> usize {
        self.connections.get(&proxy_id).map(|v| *v).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.connections.iter().map(|entry| *entry.value()).sum()
    }
}

/// Selects proxies in round-robin order
///
/// Uses atomic operations for lock-free index tracking.
pub struct RoundRobinSelector {
    proxies: RwLock<Vec<Arc<Proxy>>>,
    index: AtomicUsize,
    tracker: ConnectionTracker,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            proxies: RwLock::new(Vec::new()),
            index: AtomicUsize::new(0),
            tracker: ConnectionTracker::new(),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxySelector for RoundRobinSelector {
    async fn select(&self, exclude: &HashSet<Uuid>) -> Result<Arc<Proxy>> {
        let proxies = self.proxies.read();
        let len = proxies.len();
        if len == 0 {
            return Err(PoolError::NoProxiesAvailable);
        }

        let start = self.index.fetch_add(1, Ordering::Relaxed);
        (0..len)
            .map(|offset| &proxies[(start + offset) % len])
            .find(|proxy| !exclude.contains(&proxy.id))
            .cloned()
            .ok_or(PoolError::NoProxiesAvailable)
    }

    async fn refresh(&self, proxies: Vec<Proxy>) -> Result<()> {
        let mut guard = self.proxies.write();
        *guard = proxies.into_iter().map(Arc::new).collect();
        // Reset index on refresh, the list size changed
        self.index.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn available_count(&self) -> usize {
        self.proxies.read().len()
    }

    fn strategy_name(&self) -> &'static str {
        "round_robin"
    }

    fn acquire(&self, proxy_id: Uuid) {
        self.tracker.acquire(proxy_id);
    }

    fn release(&self, proxy_id: Uuid) {
        self.tracker.release(proxy_id);
    }

    fn in_flight(&self) -> usize {
        self.tracker.total()
    }
}
