use crate::error::{PoolError, Result};
use sqlx::{Executor, PgPool};
use tracing::info;

/// Apply pending migrations in version order. Returns how many ran.
pub async fn run_migrations(pool: &PgPool) -> Result<usize> {
    create_migrations_table(pool).await?;

    let mut applied = 0;
    for (version, name, sql) in get_migrations() {
        if !is_migration_applied(pool, version).await? {
            info!(version = version, name = name, "Applying migration");

            // Plain string execution runs every statement of the script.
            pool.execute(sql).await.map_err(PoolError::Database)?;
            record_migration(pool, version, name).await?;

            info!(version = version, name = name, "Migration applied successfully");
            applied += 1;
        }
    }

    Ok(applied)
}

/// Create the migrations tracking table
async fn create_migrations_table(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn is_migration_applied(pool: &PgPool, version: i32) -> Result<bool> {
    let result = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM schema_migrations WHERE version = $1",
    )
    .bind(version)
    .fetch_one(pool)
    .await?;

    Ok(result > 0)
}

async fn record_migration(pool: &PgPool, version: i32, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
        .bind(version)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}

/// Get all migrations in order
fn get_migrations() -> Vec<(i32, &'static str, &'static str)> {
    vec![
        (1, "connectors_and_proxies", MIGRATION_001_CONNECTORS_AND_PROXIES),
        (2, "tasks", MIGRATION_002_TASKS),
        (3, "free_proxies", MIGRATION_003_FREE_PROXIES),
        (4, "projects_and_rotation", MIGRATION_004_PROJECTS_AND_ROTATION),
    ]
}

// Migration 1: connectors own proxies
const MIGRATION_001_CONNECTORS_AND_PROXIES: &str = r#"
CREATE TABLE IF NOT EXISTS connectors (
    id UUID PRIMARY KEY,
    project_id UUID NOT NULL,
    name VARCHAR(255) NOT NULL,
    provider VARCHAR(64) NOT NULL,
    credential JSONB NOT NULL DEFAULT '{}',
    config JSONB NOT NULL DEFAULT '{}',
    proxies_max INTEGER NOT NULL DEFAULT 0,
    active BOOLEAN NOT NULL DEFAULT FALSE,
    installed BOOLEAN NOT NULL DEFAULT FALSE,
    certificate JSONB,
    error TEXT,
    created_ts BIGINT NOT NULL,
    updated_ts BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_connectors_project ON connectors(project_id);

CREATE TABLE IF NOT EXISTS proxies (
    id UUID PRIMARY KEY,
    project_id UUID NOT NULL,
    connector_id UUID NOT NULL REFERENCES connectors(id),
    provider VARCHAR(64) NOT NULL,
    key VARCHAR(255) NOT NULL,
    name VARCHAR(255) NOT NULL,
    status VARCHAR(20) NOT NULL,
    config JSONB,
    fingerprint JSONB,
    fingerprint_error TEXT,
    probe_failures INTEGER NOT NULL DEFAULT 0,
    replaced BOOLEAN NOT NULL DEFAULT FALSE,
    created_ts BIGINT NOT NULL,
    next_refresh_ts BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_proxies_connector ON proxies(connector_id);
CREATE INDEX IF NOT EXISTS idx_proxies_refresh ON proxies(status, next_refresh_ts);
"#;

// Migration 2: tasks, at most one running and one locked per connector
const MIGRATION_002_TASKS: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id UUID PRIMARY KEY,
    project_id UUID NOT NULL,
    connector_id UUID NOT NULL,
    kind VARCHAR(32) NOT NULL,
    running BOOLEAN NOT NULL,
    cancelled BOOLEAN NOT NULL DEFAULT FALSE,
    locked BOOLEAN NOT NULL DEFAULT FALSE,
    step_current INTEGER NOT NULL DEFAULT 0,
    step_max INTEGER NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    start_at_ts BIGINT NOT NULL,
    end_at_ts BIGINT,
    next_retry_ts BIGINT NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0,
    data JSONB NOT NULL DEFAULT '{}',
    jwt TEXT NOT NULL DEFAULT ''
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_one_running
    ON tasks(connector_id) WHERE running;
CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_one_locked
    ON tasks(connector_id) WHERE locked;
CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(next_retry_ts) WHERE running;
CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id, start_at_ts DESC);
"#;

// Migration 3: free proxy candidates of list-backed connectors
const MIGRATION_003_FREE_PROXIES: &str = r#"
CREATE TABLE IF NOT EXISTS free_proxies (
    id UUID PRIMARY KEY,
    project_id UUID NOT NULL,
    connector_id UUID NOT NULL,
    key VARCHAR(512) NOT NULL,
    fingerprint JSONB,
    fingerprint_error TEXT,
    next_refresh_ts BIGINT NOT NULL,
    CONSTRAINT unique_free_proxy_key UNIQUE (connector_id, key)
);

CREATE INDEX IF NOT EXISTS idx_free_proxies_refresh ON free_proxies(next_refresh_ts);
"#;

// Migration 4: project pool policy, per-proxy rotation and reachability
const MIGRATION_004_PROJECTS_AND_ROTATION: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id UUID PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    status VARCHAR(8) NOT NULL,
    connector_default_id UUID,
    proxies_min INTEGER NOT NULL DEFAULT 1,
    auto_rotate BOOLEAN NOT NULL DEFAULT FALSE,
    auto_rotate_delay_min BIGINT NOT NULL,
    auto_rotate_delay_max BIGINT NOT NULL,
    auto_scale_up BOOLEAN NOT NULL DEFAULT TRUE,
    auto_scale_down BOOLEAN NOT NULL DEFAULT FALSE,
    auto_scale_down_delay BIGINT NOT NULL,
    last_data_ts BIGINT NOT NULL,
    created_ts BIGINT NOT NULL,
    updated_ts BIGINT NOT NULL
);

ALTER TABLE proxies
    ADD COLUMN IF NOT EXISTS auto_rotate_delay_factor DOUBLE PRECISION NOT NULL DEFAULT 0.5,
    ADD COLUMN IF NOT EXISTS disconnected_ts BIGINT;
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_unique() {
        let migrations = get_migrations();
        let versions: Vec<i32> = migrations.iter().map(|(v, _, _)| *v).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn test_task_table_enforces_single_running_task() {
        assert!(MIGRATION_002_TASKS.contains("ON tasks(connector_id) WHERE running"));
    }
}
