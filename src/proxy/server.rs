//! Relay server implementation using hyper
//!
//! Accepts client connections and hands every request to the [`RelayHandler`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RelayServerConfig;
use crate::connectors::ConnectorRegistry;
use crate::error::{PoolError, Result};
use crate::proxy::handler::{error_response, RelayHandler, RelayHandlerConfig};
use crate::proxy::selector::ProxySelector;
use crate::services::ProjectActivity;
use crate::transports::TransportRegistry;

/// Relay server
pub struct RelayServer {
    config: RelayServerConfig,
    handler: Arc<RelayHandler>,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new(
        config: RelayServerConfig,
        selector: Arc<dyn ProxySelector>,
        connectors: ConnectorRegistry,
        transports: TransportRegistry,
    ) -> Self {
        let handler_config = RelayHandlerConfig {
            max_retries: config.max_retries,
            connect_timeout: Duration::from_secs(config.connect_timeout),
            request_timeout: Duration::from_secs(config.request_timeout),
        };
        let handler = Arc::new(RelayHandler::new(
            selector,
            connectors,
            transports,
            handler_config,
        ));

        Self { config, handler }
    }

    /// Report relayed traffic to `activity`. Only effective before serving.
    pub fn with_activity(mut self, activity: ProjectActivity) -> Self {
        match Arc::get_mut(&mut self.handler) {
            Some(handler) => handler.set_activity(activity),
            None => warn!("Relay handler already shared, traffic is not recorded"),
        }
        self
    }

    /// Bind `RELAY_HOST:RELAY_PORT` and serve until shutdown
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| PoolError::InvalidConfig(format!("Invalid relay server address: {}", e)))?;

        let listener = TcpListener::bind(addr).await?;
        info!("Relay server listening on {}", addr);
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    #[instrument(skip(self, listener, shutdown))]
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, client_addr, handler).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let closed = self.handler.sockets().close_all();
                        info!(closed, "Relay server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single client connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        handler: Arc<RelayHandler>,
    ) -> Result<()> {
        let io = TokioIo::new(stream);
        let client_ip = client_addr.ip().to_string();

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let client_ip = client_ip.clone();

            async move {
                match handler.handle(req, client_ip).await {
                    Ok(response) => Ok::<_, Infallible>(response),
                    Err(e) => {
                        error!("Request handling error: {}", e);
                        let status = match e.status_code() {
                            StatusCode::BAD_REQUEST => StatusCode::BAD_REQUEST,
                            _ => StatusCode::INTERNAL_SERVER_ERROR,
                        };
                        Ok(error_response(status, &format!("Error: {}", e)))
                    }
                }
            }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| PoolError::ProxyConnectionFailed(e.to_string()))?;

        Ok(())
    }
}
