use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{PoolError, Result};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Shared Postgres pool backing `PgStore`
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect, retrying while the server is still coming up.
    pub async fn new(config: &Config) -> Result<Self> {
        let url = config.database_url();
        let db = &config.database;

        info!(
            host = %db.host,
            port = %db.port,
            database = %db.name,
            "Connecting to database"
        );

        let options = PgPoolOptions::new()
            .min_connections(db.min_connections)
            .max_connections(db.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(30 * 60))
            .max_lifetime(Duration::from_secs(60 * 60));

        let mut attempt = 1;
        let pool = loop {
            match options.clone().connect(&url).await {
                Ok(pool) => break pool,
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    warn!(
                        attempt,
                        "Database not reachable yet: {} (retrying in {:?})", e, CONNECT_BACKOFF
                    );
                    attempt += 1;
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
                Err(e) => return Err(PoolError::DatabaseConnection(e.to_string())),
            }
        };

        let database = Database { pool };
        let latency = database.ping().await?;
        info!(
            latency_ms = latency.as_millis() as u64,
            "Database connection pool established"
        );

        Ok(database)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip time of a trivial query
    pub async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(start.elapsed())
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let applied = super::migrations::run_migrations(&self.pool).await?;
        info!(applied, "Database schema up to date");
        Ok(())
    }

    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }
}
