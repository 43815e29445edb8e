use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{Store, PROBED_STATUSES};
use crate::database::Database;
use crate::error::{PoolError, Result};
use crate::models::{
    Certificate, Connector, DelayRange, Fingerprint, FreeProxy, Project, ProjectStatus, Proxy,
    ProxyStatus, Task, TaskKind, TaskUpdate,
};

const CONNECTOR_COLUMNS: &str = r#"
    id, project_id, name, provider, credential, config, proxies_max,
    active, installed, certificate, error, created_ts, updated_ts
"#;

const PROXY_COLUMNS: &str = r#"
    id, project_id, connector_id, provider, key, name, status, config,
    fingerprint, fingerprint_error, probe_failures, replaced, auto_rotate_delay_factor,
    disconnected_ts, created_ts, next_refresh_ts
"#;

const PROJECT_COLUMNS: &str = r#"
    id, name, status, connector_default_id, proxies_min, auto_rotate, auto_rotate_delay_min,
    auto_rotate_delay_max, auto_scale_up, auto_scale_down, auto_scale_down_delay, last_data_ts,
    created_ts, updated_ts
"#;

const TASK_COLUMNS: &str = r#"
    id, project_id, connector_id, kind, running, cancelled, locked,
    step_current, step_max, message, start_at_ts, end_at_ts, next_retry_ts,
    retries, data, jwt
"#;

const FREE_PROXY_COLUMNS: &str = r#"
    id, project_id, connector_id, key, fingerprint, fingerprint_error, next_refresh_ts
"#;

#[derive(FromRow)]
struct ConnectorRow {
    id: Uuid,
    project_id: Uuid,
    name: String,
    provider: String,
    credential: Value,
    config: Value,
    proxies_max: i32,
    active: bool,
    installed: bool,
    certificate: Option<Json<Certificate>>,
    error: Option<String>,
    created_ts: i64,
    updated_ts: i64,
}

impl From<ConnectorRow> for Connector {
    fn from(row: ConnectorRow) -> Self {
        Self {
            id: row.id,
            project_id: row.project_id,
            name: row.name,
            provider: row.provider,
            credential: row.credential,
            config: row.config,
            proxies_max: row.proxies_max.max(0) as u32,
            active: row.active,
            installed: row.installed,
            certificate: row.certificate.map(|c| c.0),
            error: row.error,
            created_ts: row.created_ts,
            updated_ts: row.updated_ts,
        }
    }
}

#[derive(FromRow)]
struct ProxyRow {
    id: Uuid,
    project_id: Uuid,
    connector_id: Uuid,
    provider: String,
    key: String,
    name: String,
    status: String,
    config: Option<Value>,
    fingerprint: Option<Json<Fingerprint>>,
    fingerprint_error: Option<String>,
    probe_failures: i32,
    replaced: bool,
    auto_rotate_delay_factor: f64,
    disconnected_ts: Option<i64>,
    created_ts: i64,
    next_refresh_ts: i64,
}

impl TryFrom<ProxyRow> for Proxy {
    type Error = PoolError;

    fn try_from(row: ProxyRow) -> Result<Self> {
        let status = ProxyStatus::from_str(&row.status)
            .ok_or_else(|| PoolError::Internal(format!("unknown proxy status '{}'", row.status)))?;
        Ok(Self {
            id: row.id,
            project_id: row.project_id,
            connector_id: row.connector_id,
            provider: row.provider,
            key: row.key,
            name: row.name,
            status,
            config: row.config,
            fingerprint: row.fingerprint.map(|f| f.0),
            fingerprint_error: row.fingerprint_error,
            probe_failures: row.probe_failures.max(0) as u32,
            replaced: row.replaced,
            auto_rotate_delay_factor: row.auto_rotate_delay_factor,
            disconnected_ts: row.disconnected_ts,
            created_ts: row.created_ts,
            next_refresh_ts: row.next_refresh_ts,
        })
    }
}

#[derive(FromRow)]
struct ProjectRow {
    id: Uuid,
    name: String,
    status: String,
    connector_default_id: Option<Uuid>,
    proxies_min: i32,
    auto_rotate: bool,
    auto_rotate_delay_min: i64,
    auto_rotate_delay_max: i64,
    auto_scale_up: bool,
    auto_scale_down: bool,
    auto_scale_down_delay: i64,
    last_data_ts: i64,
    created_ts: i64,
    updated_ts: i64,
}

impl TryFrom<ProjectRow> for Project {
    type Error = PoolError;

    fn try_from(row: ProjectRow) -> Result<Self> {
        let status = ProjectStatus::from_str(&row.status)
            .ok_or_else(|| PoolError::Internal(format!("unknown project status '{}'", row.status)))?;
        Ok(Self {
            id: row.id,
            name: row.name,
            status,
            connector_default_id: row.connector_default_id,
            proxies_min: row.proxies_min.max(0) as u32,
            auto_rotate: row.auto_rotate,
            auto_rotate_delay_range: DelayRange {
                min: row.auto_rotate_delay_min,
                max: row.auto_rotate_delay_max,
            },
            auto_scale_up: row.auto_scale_up,
            auto_scale_down: row.auto_scale_down,
            auto_scale_down_delay: row.auto_scale_down_delay,
            last_data_ts: row.last_data_ts,
            created_ts: row.created_ts,
            updated_ts: row.updated_ts,
        })
    }
}

#[derive(FromRow)]
struct TaskRow {
    id: Uuid,
    project_id: Uuid,
    connector_id: Uuid,
    kind: String,
    running: bool,
    cancelled: bool,
    locked: bool,
    step_current: i32,
    step_max: i32,
    message: String,
    start_at_ts: i64,
    end_at_ts: Option<i64>,
    next_retry_ts: i64,
    retries: i32,
    data: Value,
    jwt: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = PoolError;

    fn try_from(row: TaskRow) -> Result<Self> {
        let kind = TaskKind::from_str(&row.kind)
            .ok_or_else(|| PoolError::Internal(format!("unknown task kind '{}'", row.kind)))?;
        Ok(Self {
            id: row.id,
            project_id: row.project_id,
            connector_id: row.connector_id,
            kind,
            running: row.running,
            cancelled: row.cancelled,
            locked: row.locked,
            step_current: row.step_current.max(0) as u32,
            step_max: row.step_max.max(0) as u32,
            message: row.message,
            start_at_ts: row.start_at_ts,
            end_at_ts: row.end_at_ts,
            next_retry_ts: row.next_retry_ts,
            retries: row.retries.max(0) as u32,
            data: row.data,
            jwt: row.jwt,
        })
    }
}

#[derive(FromRow)]
struct FreeProxyRow {
    id: Uuid,
    project_id: Uuid,
    connector_id: Uuid,
    key: String,
    fingerprint: Option<Json<Fingerprint>>,
    fingerprint_error: Option<String>,
    next_refresh_ts: i64,
}

impl From<FreeProxyRow> for FreeProxy {
    fn from(row: FreeProxyRow) -> Self {
        Self {
            id: row.id,
            project_id: row.project_id,
            connector_id: row.connector_id,
            key: row.key,
            fingerprint: row.fingerprint.map(|f| f.0),
            fingerprint_error: row.fingerprint_error,
            next_refresh_ts: row.next_refresh_ts,
        }
    }
}

fn proxies_from_rows(rows: Vec<ProxyRow>) -> Result<Vec<Proxy>> {
    rows.into_iter().map(Proxy::try_from).collect()
}

fn tasks_from_rows(rows: Vec<TaskRow>) -> Result<Vec<Task>> {
    rows.into_iter().map(Task::try_from).collect()
}

fn statuses(list: &[ProxyStatus]) -> Vec<String> {
    list.iter().map(|s| s.as_str().to_string()).collect()
}

/// Map the partial unique index on running tasks to its domain error.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Store backed by PostgreSQL. Safe to share between orchestrator instances.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(database: &Database) -> Self {
        Self {
            pool: database.pool().clone(),
        }
    }

    async fn write_proxy<'e, E>(executor: E, proxy: &Proxy, expected: ProxyStatus) -> Result<u64>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r#"
            UPDATE proxies
            SET key = $3, name = $4, status = $5, config = $6, fingerprint = $7,
                fingerprint_error = $8, probe_failures = $9, replaced = $10,
                next_refresh_ts = $11, disconnected_ts = $13
            WHERE id = $1 AND project_id = $2 AND status = $12
            "#,
        )
        .bind(proxy.id)
        .bind(proxy.project_id)
        .bind(&proxy.key)
        .bind(&proxy.name)
        .bind(proxy.status.as_str())
        .bind(&proxy.config)
        .bind(proxy.fingerprint.as_ref().map(Json))
        .bind(&proxy.fingerprint_error)
        .bind(proxy.probe_failures as i32)
        .bind(proxy.replaced)
        .bind(proxy.next_refresh_ts)
        .bind(expected.as_str())
        .bind(proxy.disconnected_ts)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>(&format!(
            "SELECT {} FROM projects WHERE id = $1",
            PROJECT_COLUMNS
        ))
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Project::try_from).transpose()
    }

    async fn save_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (
                id, name, status, connector_default_id, proxies_min, auto_rotate,
                auto_rotate_delay_min, auto_rotate_delay_max, auto_scale_up, auto_scale_down,
                auto_scale_down_delay, last_data_ts, created_ts, updated_ts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                status = EXCLUDED.status,
                connector_default_id = EXCLUDED.connector_default_id,
                proxies_min = EXCLUDED.proxies_min,
                auto_rotate = EXCLUDED.auto_rotate,
                auto_rotate_delay_min = EXCLUDED.auto_rotate_delay_min,
                auto_rotate_delay_max = EXCLUDED.auto_rotate_delay_max,
                auto_scale_up = EXCLUDED.auto_scale_up,
                auto_scale_down = EXCLUDED.auto_scale_down,
                auto_scale_down_delay = EXCLUDED.auto_scale_down_delay,
                last_data_ts = GREATEST(projects.last_data_ts, EXCLUDED.last_data_ts),
                updated_ts = EXCLUDED.updated_ts
            "#,
        )
        .bind(project.id)
        .bind(&project.name)
        .bind(project.status.as_str())
        .bind(project.connector_default_id)
        .bind(project.proxies_min as i32)
        .bind(project.auto_rotate)
        .bind(project.auto_rotate_delay_range.min)
        .bind(project.auto_rotate_delay_range.max)
        .bind(project.auto_scale_up)
        .bind(project.auto_scale_down)
        .bind(project.auto_scale_down_delay)
        .bind(project.last_data_ts)
        .bind(project.created_ts)
        .bind(project.updated_ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_connector(&self, connector: &Connector) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO connectors (
                id, project_id, name, provider, credential, config, proxies_max,
                active, installed, certificate, error, created_ts, updated_ts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(connector.id)
        .bind(connector.project_id)
        .bind(&connector.name)
        .bind(&connector.provider)
        .bind(&connector.credential)
        .bind(&connector.config)
        .bind(connector.proxies_max as i32)
        .bind(connector.active)
        .bind(connector.installed)
        .bind(connector.certificate.as_ref().map(Json))
        .bind(&connector.error)
        .bind(connector.created_ts)
        .bind(connector.updated_ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_connector(&self, connector: &Connector) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE connectors
            SET name = $3, credential = $4, config = $5, proxies_max = $6,
                active = $7, installed = $8, certificate = $9, error = $10,
                updated_ts = $11
            WHERE id = $1 AND project_id = $2
            "#,
        )
        .bind(connector.id)
        .bind(connector.project_id)
        .bind(&connector.name)
        .bind(&connector.credential)
        .bind(&connector.config)
        .bind(connector.proxies_max as i32)
        .bind(connector.active)
        .bind(connector.installed)
        .bind(connector.certificate.as_ref().map(Json))
        .bind(&connector.error)
        .bind(connector.updated_ts)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PoolError::ConnectorNotFound { id: connector.id });
        }
        Ok(())
    }

    async fn remove_connector(&self, project_id: Uuid, connector_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM connectors WHERE id = $1 AND project_id = $2 FOR UPDATE",
        )
        .bind(connector_id)
        .bind(project_id)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_none() {
            return Err(PoolError::ConnectorNotFound { id: connector_id });
        }

        let proxies: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM proxies WHERE connector_id = $1")
                .bind(connector_id)
                .fetch_one(&mut *tx)
                .await?;
        if proxies > 0 {
            return Err(PoolError::Conflict(format!(
                "connector {} still has proxies",
                connector_id
            )));
        }

        let running: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE connector_id = $1 AND running")
                .bind(connector_id)
                .fetch_one(&mut *tx)
                .await?;
        if running > 0 {
            return Err(PoolError::Conflict(format!(
                "connector {} has a running task",
                connector_id
            )));
        }

        sqlx::query("DELETE FROM tasks WHERE connector_id = $1")
            .bind(connector_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM free_proxies WHERE connector_id = $1")
            .bind(connector_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM connectors WHERE id = $1")
            .bind(connector_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_connector(&self, project_id: Uuid, connector_id: Uuid) -> Result<Connector> {
        let row = sqlx::query_as::<_, ConnectorRow>(&format!(
            "SELECT {} FROM connectors WHERE id = $1 AND project_id = $2",
            CONNECTOR_COLUMNS
        ))
        .bind(connector_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Connector::from)
            .ok_or(PoolError::ConnectorNotFound { id: connector_id })
    }

    async fn list_connectors(&self, project_id: Uuid) -> Result<Vec<Connector>> {
        let rows = sqlx::query_as::<_, ConnectorRow>(&format!(
            "SELECT {} FROM connectors WHERE project_id = $1 ORDER BY created_ts",
            CONNECTOR_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Connector::from).collect())
    }

    async fn list_all_connectors(&self) -> Result<Vec<Connector>> {
        let rows = sqlx::query_as::<_, ConnectorRow>(&format!(
            "SELECT {} FROM connectors ORDER BY created_ts",
            CONNECTOR_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Connector::from).collect())
    }

    async fn create_proxies(&self, proxies: &[Proxy]) -> Result<()> {
        if proxies.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::<Postgres>::new(
            r#"
            INSERT INTO proxies (
                id, project_id, connector_id, provider, key, name, status, config,
                fingerprint, fingerprint_error, probe_failures, replaced,
                auto_rotate_delay_factor, disconnected_ts, created_ts, next_refresh_ts
            )
            "#,
        );
        builder.push_values(proxies, |mut row, proxy| {
            row.push_bind(proxy.id)
                .push_bind(proxy.project_id)
                .push_bind(proxy.connector_id)
                .push_bind(&proxy.provider)
                .push_bind(&proxy.key)
                .push_bind(&proxy.name)
                .push_bind(proxy.status.as_str())
                .push_bind(&proxy.config)
                .push_bind(proxy.fingerprint.as_ref().map(Json))
                .push_bind(&proxy.fingerprint_error)
                .push_bind(proxy.probe_failures as i32)
                .push_bind(proxy.replaced)
                .push_bind(proxy.auto_rotate_delay_factor)
                .push_bind(proxy.disconnected_ts)
                .push_bind(proxy.created_ts)
                .push_bind(proxy.next_refresh_ts);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn update_proxy(&self, proxy: &Proxy, expected: ProxyStatus) -> Result<bool> {
        if Self::write_proxy(&self.pool, proxy, expected).await? > 0 {
            return Ok(true);
        }

        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM proxies WHERE id = $1 AND project_id = $2)",
        )
        .bind(proxy.id)
        .bind(proxy.project_id)
        .fetch_one(&self.pool)
        .await?;
        if !exists {
            return Err(PoolError::ProxyNotFound { id: proxy.id });
        }
        Ok(false)
    }

    async fn remove_proxies(&self, project_id: Uuid, ids: &[Uuid]) -> Result<usize> {
        let result = sqlx::query("DELETE FROM proxies WHERE project_id = $1 AND id = ANY($2)")
            .bind(project_id)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn get_proxies(&self, project_id: Uuid, ids: &[Uuid]) -> Result<Vec<Proxy>> {
        let rows = sqlx::query_as::<_, ProxyRow>(&format!(
            "SELECT {} FROM proxies WHERE project_id = $1 AND id = ANY($2) ORDER BY created_ts",
            PROXY_COLUMNS
        ))
        .bind(project_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        proxies_from_rows(rows)
    }

    async fn list_connector_proxies(
        &self,
        project_id: Uuid,
        connector_id: Uuid,
    ) -> Result<Vec<Proxy>> {
        let rows = sqlx::query_as::<_, ProxyRow>(&format!(
            "SELECT {} FROM proxies WHERE project_id = $1 AND connector_id = $2 ORDER BY created_ts",
            PROXY_COLUMNS
        ))
        .bind(project_id)
        .bind(connector_id)
        .fetch_all(&self.pool)
        .await?;
        proxies_from_rows(rows)
    }

    async fn list_proxies_by_status(&self, list: &[ProxyStatus]) -> Result<Vec<Proxy>> {
        let rows = sqlx::query_as::<_, ProxyRow>(&format!(
            "SELECT {} FROM proxies WHERE status = ANY($1) ORDER BY created_ts",
            PROXY_COLUMNS
        ))
        .bind(statuses(list))
        .fetch_all(&self.pool)
        .await?;
        proxies_from_rows(rows)
    }

    async fn claim_proxies_to_refresh(
        &self,
        now: i64,
        claim_until: i64,
        limit: usize,
    ) -> Result<Vec<Proxy>> {
        let rows = sqlx::query_as::<_, ProxyRow>(&format!(
            r#"
            UPDATE proxies SET next_refresh_ts = $2
            WHERE id IN (
                SELECT id FROM proxies
                WHERE status = ANY($1) AND next_refresh_ts <= $3
                ORDER BY next_refresh_ts
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            PROXY_COLUMNS
        ))
        .bind(statuses(&PROBED_STATUSES))
        .bind(claim_until)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        proxies_from_rows(rows)
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                id, project_id, connector_id, kind, running, cancelled, locked,
                step_current, step_max, message, start_at_ts, end_at_ts,
                next_retry_ts, retries, data, jwt
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(task.id)
        .bind(task.project_id)
        .bind(task.connector_id)
        .bind(task.kind.as_str())
        .bind(task.running)
        .bind(task.cancelled)
        .bind(task.locked)
        .bind(task.step_current as i32)
        .bind(task.step_max as i32)
        .bind(&task.message)
        .bind(task.start_at_ts)
        .bind(task.end_at_ts)
        .bind(task.next_retry_ts)
        .bind(task.retries as i32)
        .bind(&task.data)
        .bind(&task.jwt)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(PoolError::TaskAlreadyRunning {
                connector_id: task.connector_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_task(&self, project_id: Uuid, task_id: Uuid) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE id = $1 AND project_id = $2",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(PoolError::TaskNotFound { id: task_id })?.try_into()
    }

    async fn list_tasks(&self, project_id: Uuid) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE project_id = $1 ORDER BY start_at_ts DESC",
            TASK_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        tasks_from_rows(rows)
    }

    async fn list_running_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE running",
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        tasks_from_rows(rows)
    }

    async fn find_running_task(
        &self,
        project_id: Uuid,
        connector_id: Uuid,
    ) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE project_id = $1 AND connector_id = $2 AND running",
            TASK_COLUMNS
        ))
        .bind(project_id)
        .bind(connector_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Task::try_from).transpose()
    }

    async fn next_task_to_run(&self, now: i64) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE running AND NOT locked AND next_retry_ts <= $1
            ORDER BY next_retry_ts
            LIMIT 1
            "#,
            TASK_COLUMNS
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Task::try_from).transpose()
    }

    async fn lock_task(&self, project_id: Uuid, task_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET locked = TRUE
            WHERE id = $1 AND project_id = $2 AND running AND NOT locked
              AND NOT EXISTS (
                  SELECT 1 FROM tasks other
                  WHERE other.connector_id = tasks.connector_id AND other.locked
              )
            "#,
        )
        .bind(task_id)
        .bind(project_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            // Another instance locked a task of the same connector first.
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_task(
        &self,
        project_id: Uuid,
        task_id: Uuid,
        update: TaskUpdate,
        now: i64,
    ) -> Result<Task> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE id = $1 AND project_id = $2 FOR UPDATE",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .bind(project_id)
        .fetch_optional(&mut *tx)
        .await?;
        let mut task: Task = row.ok_or(PoolError::TaskNotFound { id: task_id })?.try_into()?;

        task.apply_update(update, now)?;
        task.locked = false;

        sqlx::query(
            r#"
            UPDATE tasks
            SET running = $2, locked = FALSE, step_current = $3, message = $4,
                end_at_ts = $5, next_retry_ts = $6, retries = $7, data = $8
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(task.running)
        .bind(task.step_current as i32)
        .bind(&task.message)
        .bind(task.end_at_ts)
        .bind(task.next_retry_ts)
        .bind(task.retries as i32)
        .bind(&task.data)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(task)
    }

    async fn release_task(&self, project_id: Uuid, task_id: Uuid) -> Result<()> {
        let result =
            sqlx::query("UPDATE tasks SET locked = FALSE WHERE id = $1 AND project_id = $2")
                .bind(task_id)
                .bind(project_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(PoolError::TaskNotFound { id: task_id });
        }
        Ok(())
    }

    async fn cancel_task(&self, project_id: Uuid, task_id: Uuid, now: i64) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            UPDATE tasks
            SET cancelled = TRUE, next_retry_ts = LEAST(next_retry_ts, $3)
            WHERE id = $1 AND project_id = $2 AND running
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(task_id)
        .bind(project_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                // Distinguish a missing task from a finished one.
                self.get_task(project_id, task_id).await?;
                Err(PoolError::TaskNotRunning { id: task_id })
            }
        }
    }

    async fn sync_free_proxies(
        &self,
        project_id: Uuid,
        connector_id: Uuid,
        keys: &[String],
        now: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM free_proxies WHERE connector_id = $1 AND NOT (key = ANY($2))")
            .bind(connector_id)
            .bind(keys)
            .execute(&mut *tx)
            .await?;

        for key in keys {
            let free_proxy = FreeProxy::new(project_id, connector_id, key.clone(), now);
            sqlx::query(
                r#"
                INSERT INTO free_proxies (id, project_id, connector_id, key, next_refresh_ts)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (connector_id, key) DO NOTHING
                "#,
            )
            .bind(free_proxy.id)
            .bind(free_proxy.project_id)
            .bind(free_proxy.connector_id)
            .bind(&free_proxy.key)
            .bind(free_proxy.next_refresh_ts)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_free_proxy(&self, free_proxy: &FreeProxy) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE free_proxies
            SET fingerprint = $2, fingerprint_error = $3, next_refresh_ts = $4
            WHERE id = $1
            "#,
        )
        .bind(free_proxy.id)
        .bind(free_proxy.fingerprint.as_ref().map(Json))
        .bind(&free_proxy.fingerprint_error)
        .bind(free_proxy.next_refresh_ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_free_proxies(
        &self,
        project_id: Uuid,
        connector_id: Uuid,
    ) -> Result<Vec<FreeProxy>> {
        let rows = sqlx::query_as::<_, FreeProxyRow>(&format!(
            "SELECT {} FROM free_proxies WHERE project_id = $1 AND connector_id = $2 ORDER BY key",
            FREE_PROXY_COLUMNS
        ))
        .bind(project_id)
        .bind(connector_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FreeProxy::from).collect())
    }

    async fn claim_free_proxies_to_refresh(
        &self,
        now: i64,
        claim_until: i64,
        limit: usize,
    ) -> Result<Vec<FreeProxy>> {
        let rows = sqlx::query_as::<_, FreeProxyRow>(&format!(
            r#"
            UPDATE free_proxies SET next_refresh_ts = $1
            WHERE id IN (
                SELECT id FROM free_proxies
                WHERE next_refresh_ts <= $2
                ORDER BY next_refresh_ts
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            FREE_PROXY_COLUMNS
        ))
        .bind(claim_until)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FreeProxy::from).collect())
    }
}
