use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Unified error type for the relaypool application
#[derive(Error, Debug)]
pub enum PoolError {
    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database connection failed: {0}")]
    DatabaseConnection(String),

    // Lookup errors
    #[error("Connector not found: {id}")]
    ConnectorNotFound { id: Uuid },

    #[error("Proxy not found: {id}")]
    ProxyNotFound { id: Uuid },

    #[error("Task not found: {id}")]
    TaskNotFound { id: Uuid },

    #[error("Project not found: {id}")]
    ProjectNotFound { id: Uuid },

    #[error("Unknown connector type: {0}")]
    ProviderNotFound(String),

    #[error("Unknown transport: {0}")]
    TransportNotFound(String),

    #[error("Duplicate registration: {0}")]
    DuplicateRegistration(String),

    // Validation errors, surfaced to the caller and never retried
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Invalid status transition for proxy {id}: {from} -> {to}")]
    InvalidStatusTransition { id: Uuid, from: String, to: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    // Task errors
    #[error("A task is already running for connector {connector_id}")]
    TaskAlreadyRunning { connector_id: Uuid },

    #[error("Task {id} is not running")]
    TaskNotRunning { id: Uuid },

    #[error("Invalid task update: {0}")]
    InvalidTaskUpdate(String),

    #[error("{0}")]
    TaskTerminal(String),

    #[error("{0}")]
    Transient(String),

    #[error("Invalid task token: {0}")]
    TaskToken(#[from] jsonwebtoken::errors::Error),

    #[error("Task token does not grant access to {0}")]
    TaskScope(String),

    // Connection errors
    #[error("Connection opened without a positive timeout")]
    MissingTimeout,

    #[error("Connection already registered: {0}")]
    DuplicateConnection(String),

    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("CONNECT failed: {0}")]
    ConnectFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("No proxies available")]
    NoProxiesAvailable,

    #[error("All proxies exhausted after {attempts} attempts")]
    AllProxiesExhausted { attempts: u32 },

    #[error("Fingerprint failed: {0}")]
    Fingerprint(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for relaypool operations
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            PoolError::Validation(_)
            | PoolError::InvalidRequest(_)
            | PoolError::InvalidProxyAddress(_)
            | PoolError::InvalidConfig(_)
            | PoolError::InvalidTaskUpdate(_)
            | PoolError::Serialization(_) => StatusCode::BAD_REQUEST,

            // 401 / 403
            PoolError::TaskToken(_) => StatusCode::UNAUTHORIZED,
            PoolError::TaskScope(_) => StatusCode::FORBIDDEN,

            // 404 Not Found
            PoolError::ConnectorNotFound { .. }
            | PoolError::ProxyNotFound { .. }
            | PoolError::TaskNotFound { .. }
            | PoolError::ProjectNotFound { .. }
            | PoolError::ProviderNotFound(_)
            | PoolError::TransportNotFound(_) => StatusCode::NOT_FOUND,

            // 409 Conflict
            PoolError::Conflict(_)
            | PoolError::TaskAlreadyRunning { .. }
            | PoolError::TaskNotRunning { .. }
            | PoolError::InvalidStatusTransition { .. } => StatusCode::CONFLICT,

            // 502 Bad Gateway
            PoolError::ProxyConnectionFailed(_)
            | PoolError::ConnectFailed(_)
            | PoolError::Tls(_)
            | PoolError::Fingerprint(_)
            | PoolError::AllProxiesExhausted { .. } => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            PoolError::NoProxiesAvailable | PoolError::DatabaseConnection(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 504 Gateway Timeout
            PoolError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            PoolError::Database(_)
            | PoolError::DuplicateRegistration(_)
            | PoolError::TaskTerminal(_)
            | PoolError::Transient(_)
            | PoolError::MissingTimeout
            | PoolError::DuplicateConnection(_)
            | PoolError::Io(_)
            | PoolError::Http(_)
            | PoolError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Errors that must end a task instead of scheduling a retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PoolError::TaskTerminal(_)
                | PoolError::Validation(_)
                | PoolError::InvalidProxyAddress(_)
                | PoolError::ConnectorNotFound { .. }
                | PoolError::ProviderNotFound(_)
                | PoolError::TransportNotFound(_)
                | PoolError::TaskToken(_)
                | PoolError::TaskScope(_)
                | PoolError::InvalidTaskUpdate(_)
                | PoolError::MissingTimeout
        )
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for PoolError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

impl From<hyper::Error> for PoolError {
    fn from(err: hyper::Error) -> Self {
        PoolError::Http(err.to_string())
    }
}

impl From<http::Error> for PoolError {
    fn from(err: http::Error) -> Self {
        PoolError::Http(err.to_string())
    }
}

impl From<url::ParseError> for PoolError {
    fn from(err: url::ParseError) -> Self {
        PoolError::InvalidProxyAddress(err.to_string())
    }
}

impl From<rustls::Error> for PoolError {
    fn from(err: rustls::Error) -> Self {
        PoolError::Tls(err.to_string())
    }
}
