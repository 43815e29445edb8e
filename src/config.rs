use crate::error::{PoolError, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Relay server configuration
    pub relay: RelayServerConfig,
    /// API server configuration
    pub api: ApiServerConfig,
    /// Storage backend selection
    pub storage: StorageBackend,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Refresh loop intervals
    pub refresh: RefreshConfig,
    /// Fingerprint probe options
    pub fingerprint: FingerprintConfig,
    /// Task retry policy
    pub tasks: TaskRetryConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Port for the relay server (default: 8000)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Maximum number of proxies tried per request
    pub max_retries: u32,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Request timeout in seconds
    pub request_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port for the API server (default: 8001)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Allowed CORS origins (comma-separated, empty = localhost only)
    pub cors_origins: Vec<String>,
    /// Secret used to sign task capability tokens
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    /// SSL mode (disable, require, prefer)
    pub ssl_mode: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Interval of each refresh domain plus batch sizes.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub connectors_interval: Duration,
    pub proxies_interval: Duration,
    pub freeproxies_interval: Duration,
    pub metrics_interval: Duration,
    pub tasks_interval: Duration,
    pub proxies_batch: usize,
    pub freeproxies_batch: usize,
    /// How far a claimed proxy's next refresh is pushed while it is probed
    pub proxy_refresh_delay: Duration,
    /// Proxies failing every probe for longer than this are removed
    pub proxy_unreachable_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct FingerprintConfig {
    pub url: Url,
    pub timeout: Duration,
    pub follow_redirect_max: u32,
    pub retry_max: u32,
    pub useragent: String,
}

#[derive(Debug, Clone)]
pub struct TaskRetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

pub const DEFAULT_FINGERPRINT_URL: &str = "https://fingerprint.scrapoxy.io/api/json";

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let jwt_secret = match get_env_or("JWT_SECRET", "") {
            s if s.is_empty() => rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(48)
                .map(char::from)
                .collect(),
            s => s,
        };

        let storage = match get_env_or("STORAGE_BACKEND", "memory").to_lowercase().as_str() {
            "memory" => StorageBackend::Memory,
            "postgres" => StorageBackend::Postgres,
            other => {
                return Err(PoolError::InvalidConfig(format!(
                    "STORAGE_BACKEND must be memory or postgres, got {}",
                    other
                )))
            }
        };

        let fingerprint_url = get_env_or("FINGERPRINT_URL", DEFAULT_FINGERPRINT_URL);
        let fingerprint_url = Url::parse(&fingerprint_url).map_err(|e| {
            PoolError::InvalidConfig(format!("FINGERPRINT_URL must be a valid URL: {}", e))
        })?;

        let tasks = TaskRetryConfig {
            base_delay: parse_millis("TASK_RETRY_BASE_DELAY", "1000")?,
            max_delay: parse_millis("TASK_RETRY_MAX_DELAY", "30000")?,
            max_attempts: parse_env("TASK_RETRY_MAX_ATTEMPTS", "5")?,
        };
        if tasks.max_delay <= tasks.base_delay {
            return Err(PoolError::InvalidConfig(
                "TASK_RETRY_MAX_DELAY must be greater than TASK_RETRY_BASE_DELAY".into(),
            ));
        }

        Ok(Config {
            relay: RelayServerConfig {
                port: get_env_or("RELAY_PORT", "8000").parse().map_err(|_| {
                    PoolError::InvalidConfig("RELAY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("RELAY_HOST", "0.0.0.0"),
                max_retries: get_env_or("RELAY_MAX_RETRIES", "3").parse().unwrap_or(3),
                connect_timeout: get_env_or("RELAY_CONNECT_TIMEOUT", "10")
                    .parse()
                    .unwrap_or(10),
                request_timeout: get_env_or("RELAY_REQUEST_TIMEOUT", "30")
                    .parse()
                    .unwrap_or(30),
            },
            api: ApiServerConfig {
                port: get_env_or("API_PORT", "8001").parse().map_err(|_| {
                    PoolError::InvalidConfig("API_PORT must be a valid port number".into())
                })?,
                host: get_env_or("API_HOST", "0.0.0.0"),
                cors_origins: get_env_or("CORS_ORIGINS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                jwt_secret,
            },
            storage,
            database: DatabaseConfig {
                host: get_env_or("DB_HOST", "localhost"),
                port: get_env_or("DB_PORT", "5432").parse().map_err(|_| {
                    PoolError::InvalidConfig("DB_PORT must be a valid port number".into())
                })?,
                user: get_env_or("DB_USER", "relaypool"),
                password: get_env_or("DB_PASSWORD", "relaypool_password"),
                name: get_env_or("DB_NAME", "relaypool"),
                ssl_mode: get_env_or("DB_SSLMODE", "disable"),
                max_connections: parse_env("DB_MAX_CONNECTIONS", "20")?,
                min_connections: parse_env("DB_MIN_CONNECTIONS", "2")?,
            },
            refresh: RefreshConfig {
                connectors_interval: parse_millis("REFRESH_CONNECTORS_INTERVAL", "2000")?,
                proxies_interval: parse_millis("REFRESH_PROXIES_INTERVAL", "1000")?,
                freeproxies_interval: parse_millis("REFRESH_FREEPROXIES_INTERVAL", "5000")?,
                metrics_interval: parse_millis("REFRESH_METRICS_INTERVAL", "10000")?,
                tasks_interval: parse_millis("REFRESH_TASKS_INTERVAL", "1000")?,
                proxies_batch: parse_env("REFRESH_PROXIES_BATCH", "50")?,
                freeproxies_batch: parse_env("REFRESH_FREEPROXIES_BATCH", "50")?,
                proxy_refresh_delay: parse_millis("PROXY_REFRESH_DELAY", "30000")?,
                proxy_unreachable_delay: parse_millis("PROXY_UNREACHABLE_DELAY", "600000")?,
            },
            fingerprint: FingerprintConfig {
                url: fingerprint_url,
                timeout: parse_millis("FINGERPRINT_TIMEOUT", "10000")?,
                follow_redirect_max: parse_env("FINGERPRINT_FOLLOW_REDIRECT_MAX", "3")?,
                retry_max: parse_env("FINGERPRINT_RETRY_MAX", "2")?,
                useragent: get_env_or(
                    "FINGERPRINT_USERAGENT",
                    concat!("relaypool/", env!("CARGO_PKG_VERSION")),
                ),
            },
            tasks,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        })
    }

    /// Get the database connection URL
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.database.user,
            self.database.password,
            self.database.host,
            self.database.port,
            self.database.name,
            self.database.ssl_mode
        )
    }

    /// Get the relay server address
    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay.host, self.relay.port)
    }

    /// Get the API server address
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| PoolError::InvalidConfig(format!("{} must be a valid number", key)))
}

/// Durations are configured in milliseconds and must be positive.
fn parse_millis(key: &str, default: &str) -> Result<Duration> {
    let millis: u64 = parse_env(key, default)?;
    if millis == 0 {
        return Err(PoolError::InvalidConfig(format!(
            "{} must be greater than zero",
            key
        )));
    }
    Ok(Duration::from_millis(millis))
}
