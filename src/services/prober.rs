//! Proxy liveness probing
//!
//! Periodically fingerprints due proxies through their own transport and
//! updates their health, replacing or retiring proxies that keep failing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, error, info, instrument, warn};

use crate::connectors::{Capabilities, ConnectorRegistry};
use crate::error::{PoolError, Result};
use crate::models::{now_ms, Fingerprint, Proxy, ProxyStatus};
use crate::net::SocketRegistry;
use crate::proxy::selector::ProxySelector;
use crate::repository::{Store, PROBED_STATUSES};
use crate::services::refresh::RefreshJob;
use crate::transports::{FingerprintProbe, FingerprintRequest, TransportRegistry};

/// Probes running at the same time within one round.
const PROBE_CONCURRENCY: usize = 16;

/// What a probe result did to a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Failing,
    /// Re-keyed in place after reaching the failure threshold
    Replaced,
    /// Marked for removal after reaching the failure threshold
    Retired,
    /// A task moved the proxy while it was probed; the result is dropped
    Skipped,
}

/// Apply one probe result to `proxy`.
///
/// `replacement_key` is only consulted when the failure threshold is hit on
/// a provider that replaces proxies in place.
pub fn apply_probe_result(
    proxy: &mut Proxy,
    result: std::result::Result<Fingerprint, String>,
    capabilities: &Capabilities,
    replacement_key: impl FnOnce(&Proxy) -> Option<String>,
    now: i64,
) -> Result<ProbeOutcome> {
    proxy.next_refresh_ts = now + capabilities.refresh_delay.as_millis() as i64;

    match result {
        Ok(fingerprint) => {
            proxy.fingerprint = Some(fingerprint);
            proxy.fingerprint_error = None;
            proxy.probe_failures = 0;
            proxy.replaced = false;
            proxy.disconnected_ts = None;
            if proxy.status == ProxyStatus::Starting {
                proxy.transition(ProxyStatus::Started)?;
            }
            Ok(ProbeOutcome::Healthy)
        }
        Err(message) => {
            proxy.fingerprint_error = Some(message);
            proxy.probe_failures += 1;
            proxy.disconnected_ts.get_or_insert(now);
            if proxy.probe_failures < capabilities.probe_failure_threshold.max(1) {
                return Ok(ProbeOutcome::Failing);
            }

            if capabilities.replace_in_place && !proxy.replaced {
                if let Some(key) = replacement_key(&*proxy) {
                    proxy.key = key;
                    proxy.fingerprint = None;
                    proxy.probe_failures = 0;
                    proxy.replaced = true;
                    proxy.disconnected_ts = None;
                    proxy.next_refresh_ts = now;
                    return Ok(ProbeOutcome::Replaced);
                }
            }

            proxy.transition(ProxyStatus::ToRemove)?;
            Ok(ProbeOutcome::Retired)
        }
    }
}

/// Liveness prober for managed proxies
pub struct ProxyProber {
    store: Arc<dyn Store>,
    connectors: ConnectorRegistry,
    transports: TransportRegistry,
    probe: FingerprintProbe,
    batch: usize,
    claim_for: Duration,
    selector: Option<Arc<dyn ProxySelector>>,
}

impl ProxyProber {
    pub fn new(
        store: Arc<dyn Store>,
        connectors: ConnectorRegistry,
        transports: TransportRegistry,
        probe: FingerprintProbe,
        batch: usize,
        claim_for: Duration,
    ) -> Self {
        Self {
            store,
            connectors,
            transports,
            probe,
            batch,
            claim_for,
            selector: None,
        }
    }

    /// Refresh the relay selection set after every round.
    pub fn with_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Probe every due proxy once. Returns how many were probed.
    #[instrument(skip(self))]
    pub async fn probe_due(&self) -> Result<usize> {
        let now = now_ms();
        let claimed = self
            .store
            .claim_proxies_to_refresh(now, now + self.claim_for.as_millis() as i64, self.batch)
            .await?;

        let probed = claimed.len();
        if probed > 0 {
            let registry = SocketRegistry::new();
            let outcomes = futures::stream::iter(claimed)
                .map(|proxy| {
                    let registry = &registry;
                    async move {
                        let id = proxy.id;
                        match self.probe_one(proxy, registry).await {
                            Ok(outcome) => Some(outcome),
                            Err(e) => {
                                warn!(proxy_id = %id, "Probe could not be recorded: {}", e);
                                None
                            }
                        }
                    }
                })
                .buffer_unordered(PROBE_CONCURRENCY)
                .collect::<Vec<_>>()
                .await;

            let leaked = registry.close_all();
            if leaked > 0 {
                debug!(leaked, "Closed sockets left open by the probe round");
            }

            let count = |wanted: ProbeOutcome| {
                outcomes
                    .iter()
                    .filter(|o| **o == Some(wanted))
                    .count()
            };
            info!(
                probed,
                healthy = count(ProbeOutcome::Healthy),
                failing = count(ProbeOutcome::Failing),
                replaced = count(ProbeOutcome::Replaced),
                retired = count(ProbeOutcome::Retired),
                skipped = count(ProbeOutcome::Skipped),
                "Probe round complete"
            );
        }

        if let Some(selector) = &self.selector {
            let started = self
                .store
                .list_proxies_by_status(&[ProxyStatus::Started])
                .await?;
            if let Err(e) = selector.refresh(started).await {
                error!("Failed to refresh relay selector: {}", e);
            }
        }
        Ok(probed)
    }

    #[instrument(skip(self, proxy, registry), fields(proxy_id = %proxy.id))]
    async fn probe_one(&self, proxy: Proxy, registry: &SocketRegistry) -> Result<ProbeOutcome> {
        let provider = self.connectors.get(&proxy.provider)?;
        let transport = self.transports.get(provider.transport())?;
        let capabilities = provider.capabilities();

        let result = match &proxy.config {
            Some(config) => {
                let request = FingerprintRequest {
                    mode: "connector",
                    connector_type: proxy.provider.clone(),
                    proxy_id: proxy.id.to_string(),
                };
                self.probe
                    .probe(transport.as_ref(), config, &request, registry)
                    .await
                    .map_err(|e| e.to_string())
            }
            None => Err("proxy has no config".to_string()),
        };

        // A task may have taken the proxy over while it was probed.
        let Some(mut current) = self
            .store
            .get_proxies(proxy.project_id, &[proxy.id])
            .await?
            .into_iter()
            .next()
        else {
            return Err(PoolError::ProxyNotFound { id: proxy.id });
        };
        if !PROBED_STATUSES.contains(&current.status) {
            debug!(status = %current.status, "Proxy moved during the probe, skipping");
            return Ok(ProbeOutcome::Skipped);
        }
        let expected = current.status;

        if let Err(message) = &result {
            debug!(failures = current.probe_failures + 1, "Probe failed: {}", message);
        }
        let outcome = apply_probe_result(
            &mut current,
            result,
            &capabilities,
            |p| provider.replacement_key(p),
            now_ms(),
        )?;

        if outcome == ProbeOutcome::Replaced {
            let connector = self
                .store
                .get_connector(current.project_id, current.connector_id)
                .await?;
            transport.complete_proxy_config(&mut current, &connector)?;
            info!(key = %current.key, "Proxy replaced in place");
        } else if outcome == ProbeOutcome::Retired {
            warn!("Proxy retired after repeated probe failures");
        }

        if !self.store.update_proxy(&current, expected).await? {
            debug!("Proxy changed while the probe result was applied, skipping");
            return Ok(ProbeOutcome::Skipped);
        }
        Ok(outcome)
    }
}

#[async_trait]
impl RefreshJob for ProxyProber {
    fn name(&self) -> &'static str {
        "proxies"
    }

    async fn refresh(&self) -> Result<()> {
        self.probe_due().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Connector;
    use crate::proxy::selector::RoundRobinSelector;
    use crate::repository::MemoryStore;
    use crate::transports::fingerprint::tests::{forward_proxy, options};
    use serde_json::json;
    use uuid::Uuid;

    fn started(status: ProxyStatus) -> Proxy {
        let mut proxy = Proxy::to_create(Uuid::nil(), Uuid::nil(), "residential", 0);
        proxy.key = "abc".to_string();
        proxy.status = status;
        proxy
    }

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            ip: "5.6.7.8".to_string(),
            ..Fingerprint::default()
        }
    }

    #[test]
    fn test_success_promotes_starting_proxy() {
        let mut proxy = started(ProxyStatus::Starting);
        proxy.probe_failures = 2;
        proxy.fingerprint_error = Some("timeout".into());
        proxy.disconnected_ts = Some(500);
        let caps = Capabilities::default();

        let outcome = apply_probe_result(&mut proxy, Ok(fingerprint()), &caps, |_| None, 1_000).unwrap();
        assert_eq!(outcome, ProbeOutcome::Healthy);
        assert_eq!(proxy.status, ProxyStatus::Started);
        assert_eq!(proxy.probe_failures, 0);
        assert!(proxy.fingerprint_error.is_none());
        assert!(proxy.disconnected_ts.is_none());
        assert_eq!(proxy.next_refresh_ts, 1_000 + caps.refresh_delay.as_millis() as i64);
    }

    #[test]
    fn test_threshold_retires_proxy() {
        let caps = Capabilities {
            probe_failure_threshold: 2,
            ..Capabilities::default()
        };
        let mut proxy = started(ProxyStatus::Started);

        let first = apply_probe_result(&mut proxy, Err("refused".into()), &caps, |_| None, 0).unwrap();
        assert_eq!(first, ProbeOutcome::Failing);
        assert_eq!(proxy.status, ProxyStatus::Started);
        assert_eq!(proxy.disconnected_ts, Some(0));

        let second = apply_probe_result(&mut proxy, Err("refused".into()), &caps, |_| None, 0).unwrap();
        assert_eq!(second, ProbeOutcome::Retired);
        assert_eq!(proxy.status, ProxyStatus::ToRemove);
        assert_eq!(proxy.fingerprint_error.as_deref(), Some("refused"));
    }

    #[test]
    fn test_replace_in_place_happens_once() {
        let caps = Capabilities {
            replace_in_place: true,
            probe_failure_threshold: 1,
            ..Capabilities::default()
        };
        let mut proxy = started(ProxyStatus::Started);

        let outcome = apply_probe_result(
            &mut proxy,
            Err("refused".into()),
            &caps,
            |_| Some("fresh".to_string()),
            10,
        )
        .unwrap();
        assert_eq!(outcome, ProbeOutcome::Replaced);
        assert_eq!(proxy.key, "fresh");
        assert_eq!(proxy.next_refresh_ts, 10);
        assert_eq!(proxy.status, ProxyStatus::Started);

        let outcome = apply_probe_result(
            &mut proxy,
            Err("refused".into()),
            &caps,
            |_| Some("again".to_string()),
            20,
        )
        .unwrap();
        assert_eq!(outcome, ProbeOutcome::Retired);
        assert_eq!(proxy.key, "fresh");
    }

    #[tokio::test]
    async fn test_probe_round_updates_store_and_selector() {
        let port = forward_proxy(|_, _| {
            (
                "200 OK".to_string(),
                String::new(),
                json!({ "ip": "9.9.9.9" }).to_string(),
            )
        })
        .await;

        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let connector = Connector::new(
            Uuid::new_v4(),
            "dc",
            "static-datacenter",
            json!({}),
            json!({ "endpoints": [format!("127.0.0.1:{}", port)] }),
            1,
            0,
        );
        store.create_connector(&connector).await.unwrap();
        let mut proxy = Proxy::to_create(connector.project_id, connector.id, "static-datacenter", 0);
        proxy.status = ProxyStatus::Starting;
        proxy.key = format!("127.0.0.1:{}", port);
        proxy.config = Some(json!({ "address": proxy.key }));
        store.create_proxies(&[proxy.clone()]).await.unwrap();

        let selector = Arc::new(RoundRobinSelector::new());
        let prober = ProxyProber::new(
            store.clone(),
            ConnectorRegistry::with_defaults().unwrap(),
            TransportRegistry::with_defaults().unwrap(),
            FingerprintProbe::new(options("http://fingerprint.test/")),
            10,
            Duration::from_secs(60),
        )
        .with_selector(selector.clone());

        assert_eq!(prober.probe_due().await.unwrap(), 1);
        let stored = store
            .get_proxies(connector.project_id, &[proxy.id])
            .await
            .unwrap()
            .remove(0);
        assert_eq!(stored.status, ProxyStatus::Started);
        assert_eq!(stored.fingerprint.unwrap().ip, "9.9.9.9");
        assert!(stored.next_refresh_ts > now_ms());
        assert_eq!(selector.available_count(), 1);

        // Not due again until the refresh delay elapsed.
        assert_eq!(prober.probe_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_removal_during_probe_is_not_reverted() {
        let store = Arc::new(MemoryStore::new());
        let connector = Connector::new(
            Uuid::new_v4(),
            "dc",
            "static-datacenter",
            json!({}),
            json!({ "endpoints": ["127.0.0.1:1"] }),
            1,
            0,
        );
        store.create_connector(&connector).await.unwrap();
        let mut proxy = Proxy::to_create(connector.project_id, connector.id, "static-datacenter", 0);
        proxy.status = ProxyStatus::Started;
        proxy.key = "endpoint".to_string();

        // The remove task flags the proxy while its fingerprint is in flight.
        let mut flagged = proxy.clone();
        flagged.status = ProxyStatus::ToRemove;
        let remover = store.clone();
        let port = forward_proxy(move |_, _| {
            futures::executor::block_on(remover.update_proxy(&flagged, ProxyStatus::Started))
                .unwrap();
            (
                "200 OK".to_string(),
                String::new(),
                json!({ "ip": "9.9.9.9" }).to_string(),
            )
        })
        .await;
        proxy.config = Some(json!({ "address": format!("127.0.0.1:{}", port) }));
        store.create_proxies(&[proxy.clone()]).await.unwrap();

        let prober = ProxyProber::new(
            store.clone(),
            ConnectorRegistry::with_defaults().unwrap(),
            TransportRegistry::with_defaults().unwrap(),
            FingerprintProbe::new(options("http://fingerprint.test/")),
            10,
            Duration::from_secs(60),
        );
        assert_eq!(prober.probe_due().await.unwrap(), 1);

        let stored = store
            .get_proxies(connector.project_id, &[proxy.id])
            .await
            .unwrap()
            .remove(0);
        assert_eq!(stored.status, ProxyStatus::ToRemove);
        assert!(stored.fingerprint.is_none());
    }
}
