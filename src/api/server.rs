//! API server using Axum
//!
//! Serves the connector, proxy and task management endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::config::ApiServerConfig;
use crate::connectors::ConnectorRegistry;
use crate::error::{PoolError, Result};
use crate::repository::Store;
use crate::services::MetricsCollector;
use crate::tasks::TaskScheduler;

use super::middleware::cors_layer;
use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub connectors: ConnectorRegistry,
    pub scheduler: Arc<TaskScheduler>,
    pub metrics: Arc<MetricsCollector>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        connectors: ConnectorRegistry,
        scheduler: Arc<TaskScheduler>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            connectors,
            scheduler,
            metrics,
            started_at: Instant::now(),
        }
    }
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the router
    pub fn build_router(&self) -> Router {
        let cors = cors_layer(&self.config.cors_origins);

        routes::create_router(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| PoolError::InvalidConfig(format!("Invalid API server address: {}", e)))?;

        let router = self.build_router();

        info!("API server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| PoolError::Internal(e.to_string()))?;

        info!("API server shut down");
        Ok(())
    }
}
