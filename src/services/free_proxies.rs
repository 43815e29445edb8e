//! Free proxy refresh
//!
//! Keeps the free proxy table of every `proxy-list` connector in sync with its
//! configured URLs and fingerprints due entries through the generic transport.
//! Only entries seen online are handed out as proxies.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::connectors::ProxyListProvider;
use crate::error::Result;
use crate::models::{now_ms, FreeProxy};
use crate::net::SocketRegistry;
use crate::repository::Store;
use crate::services::refresh::RefreshJob;
use crate::transports::{FingerprintProbe, FingerprintRequest, GenericTransport, Transport};

const PROXY_LIST_TYPE: &str = "proxy-list";
const PROBE_CONCURRENCY: usize = 16;

pub struct FreeProxyRefresher {
    store: Arc<dyn Store>,
    transport: GenericTransport,
    probe: FingerprintProbe,
    batch: usize,
    claim_for: Duration,
    /// Cadence of re-probing an entry
    refresh_delay: Duration,
}

impl FreeProxyRefresher {
    pub fn new(
        store: Arc<dyn Store>,
        probe: FingerprintProbe,
        batch: usize,
        claim_for: Duration,
        refresh_delay: Duration,
    ) -> Self {
        Self {
            store,
            transport: GenericTransport,
            probe,
            batch,
            claim_for,
            refresh_delay,
        }
    }

    /// Mirror the configured URLs of every proxy-list connector.
    pub async fn sync_all(&self, now: i64) -> Result<usize> {
        let mut synced = 0;
        for connector in self.store.list_all_connectors().await? {
            if connector.provider != PROXY_LIST_TYPE {
                continue;
            }
            let urls = ProxyListProvider::urls(&connector);
            self.store
                .sync_free_proxies(connector.project_id, connector.id, &urls, now)
                .await?;
            synced += urls.len();
        }
        Ok(synced)
    }

    /// Probe due entries once. Returns (probed, online).
    #[instrument(skip(self))]
    pub async fn probe_due(&self, now: i64) -> Result<(usize, usize)> {
        let claimed = self
            .store
            .claim_free_proxies_to_refresh(now, now + self.claim_for.as_millis() as i64, self.batch)
            .await?;
        if claimed.is_empty() {
            return Ok((0, 0));
        }

        let registry = SocketRegistry::new();
        let results = futures::stream::iter(claimed)
            .map(|free_proxy| {
                let registry = &registry;
                async move { self.probe_one(free_proxy, registry).await }
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;
        registry.close_all();

        let probed = results.len();
        let mut online = 0;
        for result in results {
            match result {
                Ok(true) => online += 1,
                Ok(false) => {}
                Err(e) => warn!("Free proxy probe could not be recorded: {}", e),
            }
        }
        Ok((probed, online))
    }

    async fn probe_one(&self, mut free_proxy: FreeProxy, registry: &SocketRegistry) -> Result<bool> {
        let request = FingerprintRequest {
            mode: "freeproxy",
            connector_type: PROXY_LIST_TYPE.to_string(),
            proxy_id: free_proxy.id.to_string(),
        };
        let config = json!({ "url": free_proxy.key });

        match self
            .probe
            .probe(&self.transport as &dyn Transport, &config, &request, registry)
            .await
        {
            Ok(fingerprint) => {
                free_proxy.fingerprint = Some(fingerprint);
                free_proxy.fingerprint_error = None;
            }
            Err(e) => {
                free_proxy.fingerprint = None;
                free_proxy.fingerprint_error = Some(e.to_string());
            }
        }
        free_proxy.next_refresh_ts = now_ms() + self.refresh_delay.as_millis() as i64;
        self.store.update_free_proxy(&free_proxy).await?;
        Ok(free_proxy.is_online())
    }
}

#[async_trait]
impl RefreshJob for FreeProxyRefresher {
    fn name(&self) -> &'static str {
        "freeproxies"
    }

    async fn refresh(&self) -> Result<()> {
        let now = now_ms();
        self.sync_all(now).await?;
        let (probed, online) = self.probe_due(now).await?;
        if probed > 0 {
            info!(probed, online, "Free proxy round complete");
        }
        Ok(())
    }
}
