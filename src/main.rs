//! Relaypool - Entry Point
//!
//! Starts the refresh loops, the relay server and the API server with
//! graceful shutdown support.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relaypool::api::{ApiServer, AppState};
use relaypool::config::{Config, LogConfig, StorageBackend};
use relaypool::connectors::ConnectorRegistry;
use relaypool::database::Database;
use relaypool::models::ProxyStatus;
use relaypool::proxy::{ProxySelector, RelayServer, RoundRobinSelector};
use relaypool::repository::{MemoryStore, PgStore, Store};
use relaypool::services::{
    FreeProxyRefresher, MetricsCollector, ProjectActivity, ProxyProber, Reconciler, RefreshHandle,
    RefreshLoop,
};
use relaypool::tasks::{RetryPolicy, TaskScheduler, TaskTokens};
use relaypool::transports::{FingerprintOptions, FingerprintProbe, TransportRegistry};

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("relaypool={},tower_http=debug", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(&config.log);

    info!("Starting Relaypool");

    // Registries are fixed for the lifetime of the process
    let transports = TransportRegistry::with_defaults().context("transport registration")?;
    let connectors = ConnectorRegistry::with_defaults().context("connector registration")?;
    connectors
        .check_transports(&transports)
        .context("connector transport lookup")?;
    info!(
        connectors = ?connectors.types(),
        transports = ?transports.names(),
        "Registries ready"
    );

    // Storage
    let (store, database): (Arc<dyn Store>, Option<Database>) = match config.storage {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; state is lost on restart");
            (Arc::new(MemoryStore::new()), None)
        }
        StorageBackend::Postgres => {
            let db = Database::new(&config).await?;
            db.run_migrations().await?;
            (Arc::new(PgStore::new(&db)), Some(db))
        }
    };

    // Relay selection set, refreshed after every probe round
    let selector = Arc::new(RoundRobinSelector::new());
    selector
        .refresh(store.list_proxies_by_status(&[ProxyStatus::Started]).await?)
        .await?;
    info!("Loaded {} started proxies", selector.available_count());
    let selector: Arc<dyn ProxySelector> = selector;

    let scheduler = Arc::new(TaskScheduler::new(
        store.clone(),
        connectors.clone(),
        transports.clone(),
        TaskTokens::new(&config.api.jwt_secret),
        RetryPolicy::from(&config.tasks),
    ));
    let probe = FingerprintProbe::new(FingerprintOptions::from(&config.fingerprint));
    let refresh = &config.refresh;

    let activity = ProjectActivity::new();
    let reconciler = Arc::new(
        Reconciler::new(store.clone(), connectors.clone(), scheduler.clone())
            .with_unreachable_delay(refresh.proxy_unreachable_delay)
            .with_activity(activity.clone()),
    );
    let prober = Arc::new(
        ProxyProber::new(
            store.clone(),
            connectors.clone(),
            transports.clone(),
            probe.clone(),
            refresh.proxies_batch,
            refresh.proxy_refresh_delay,
        )
        .with_selector(selector.clone()),
    );
    let free_proxies = Arc::new(FreeProxyRefresher::new(
        store.clone(),
        probe,
        refresh.freeproxies_batch,
        refresh.proxy_refresh_delay,
        refresh.proxy_refresh_delay,
    ));
    let metrics = Arc::new(MetricsCollector::new(store.clone()).with_selector(selector.clone()));

    let loops: Vec<RefreshHandle> = vec![
        RefreshLoop::new(scheduler.clone(), refresh.tasks_interval).spawn(),
        RefreshLoop::new(reconciler, refresh.connectors_interval).spawn(),
        RefreshLoop::new(prober, refresh.proxies_interval).spawn(),
        RefreshLoop::new(free_proxies, refresh.freeproxies_interval).spawn(),
        RefreshLoop::new(metrics.clone(), refresh.metrics_interval).spawn(),
    ];

    // Create shutdown channel for the servers
    let (shutdown_tx, _) = watch::channel(false);

    let relay_server = RelayServer::new(
        config.relay.clone(),
        selector.clone(),
        connectors.clone(),
        transports.clone(),
    )
    .with_activity(activity);
    let api_server = ApiServer::new(
        config.api.clone(),
        AppState::new(store.clone(), connectors, scheduler, metrics),
    );

    let relay_shutdown = shutdown_tx.subscribe();
    let api_shutdown = shutdown_tx.subscribe();

    let relay_task = tokio::spawn(async move {
        if let Err(e) = relay_server.run(relay_shutdown).await {
            error!("Relay server error: {}", e);
        }
    });

    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(api_shutdown).await {
            error!("API server error: {}", e);
        }
    });

    info!(
        "Servers started - Relay: {}:{}, API: {}:{}",
        config.relay.host, config.relay.port, config.api.host, config.api.port
    );

    // Wait for shutdown signal
    shutdown_signal().await?;
    info!("Shutdown signal received");

    // Send shutdown signal to all services
    let _ = shutdown_tx.send(true);
    for handle in loops {
        handle.stop().await;
    }
    let _ = tokio::join!(relay_task, api_task);

    if let Some(db) = database {
        db.close().await;
    }

    info!("Relaypool stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => result.context("failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    Ok(())
}
