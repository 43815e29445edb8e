//! Connector management handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::api::server::AppState;
use crate::connectors::ConnectorProvider;
use crate::error::PoolError;
use crate::models::{now_ms, Certificate, Connector, ConnectorView, TaskKind, TaskView};
use crate::net::tls::parse_certificate;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConnectorRequest {
    pub name: String,
    /// Provider type key
    #[serde(rename = "type")]
    pub provider: String,
    #[serde(default)]
    pub credential: Value,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub proxies_max: u32,
    #[serde(default)]
    pub active: bool,
    pub certificate: Option<Certificate>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConnectorRequest {
    pub name: Option<String>,
    pub credential: Option<Value>,
    pub config: Option<Value>,
    pub proxies_max: Option<u32>,
    pub certificate: Option<Certificate>,
}

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub active: bool,
}

fn validate_name(name: &str) -> Result<(), PoolError> {
    if name.trim().is_empty() {
        return Err(PoolError::Validation("name is required".to_string()));
    }
    Ok(())
}

fn validate_certificate(certificate: &Certificate) -> Result<(), PoolError> {
    parse_certificate(certificate)
        .map(|_| ())
        .map_err(|e| PoolError::Validation(format!("certificate: {}", e)))
}

fn provider_for(
    state: &AppState,
    provider_type: &str,
) -> Result<std::sync::Arc<dyn ConnectorProvider>, PoolError> {
    state
        .connectors
        .get(provider_type)
        .map_err(|_| PoolError::Validation(format!("unknown connector type {}", provider_type)))
}

/// List the project's connectors
pub async fn list_connectors(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<impl IntoResponse, PoolError> {
    let connectors = state.store.list_connectors(project_id).await?;
    let views: Vec<ConnectorView> = connectors.iter().map(ConnectorView::from).collect();
    Ok(Json(views))
}

/// Get a single connector
pub async fn get_connector(
    State(state): State<AppState>,
    Path((project_id, connector_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, PoolError> {
    let connector = state.store.get_connector(project_id, connector_id).await?;
    Ok(Json(ConnectorView::from(&connector)))
}

/// Create a connector after validating its settings through the provider
pub async fn create_connector(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(req): Json<CreateConnectorRequest>,
) -> Result<impl IntoResponse, PoolError> {
    validate_name(&req.name)?;
    let provider = provider_for(&state, &req.provider)?;
    provider.validate_credential(&req.credential)?;
    provider.validate_config(&req.config)?;
    if let Some(certificate) = &req.certificate {
        validate_certificate(certificate)?;
    }

    let mut connector = Connector::new(
        project_id,
        req.name.trim(),
        provider.provider_type(),
        req.credential,
        req.config,
        req.proxies_max,
        now_ms(),
    );
    connector.active = req.active;
    connector.certificate = req.certificate;
    state.store.create_connector(&connector).await?;

    info!(
        connector_id = %connector.id,
        provider = %connector.provider,
        "Created connector"
    );

    Ok((StatusCode::CREATED, Json(ConnectorView::from(&connector))))
}

/// Update a connector. Changed settings are validated again.
pub async fn update_connector(
    State(state): State<AppState>,
    Path((project_id, connector_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateConnectorRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let mut connector = state.store.get_connector(project_id, connector_id).await?;
    let provider = provider_for(&state, &connector.provider)?;

    if let Some(name) = req.name {
        validate_name(&name)?;
        connector.name = name.trim().to_string();
    }
    if let Some(credential) = req.credential {
        provider.validate_credential(&credential)?;
        connector.credential = credential;
    }
    if let Some(config) = req.config {
        provider.validate_config(&config)?;
        connector.config = config;
    }
    if let Some(proxies_max) = req.proxies_max {
        connector.proxies_max = proxies_max;
    }
    if let Some(certificate) = req.certificate {
        validate_certificate(&certificate)?;
        connector.certificate = Some(certificate);
        connector.error = None;
    }
    connector.updated_ts = now_ms();
    state.store.update_connector(&connector).await?;

    info!(connector_id = %connector.id, "Updated connector");
    Ok(Json(ConnectorView::from(&connector)))
}

/// Delete a connector that holds no proxies and runs no task
pub async fn delete_connector(
    State(state): State<AppState>,
    Path((project_id, connector_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, PoolError> {
    let connector = state.store.get_connector(project_id, connector_id).await?;

    if state
        .store
        .find_running_task(project_id, connector_id)
        .await?
        .is_some()
    {
        return Err(PoolError::Conflict(
            "connector has a running task".to_string(),
        ));
    }
    let proxies = state
        .store
        .list_connector_proxies(project_id, connector_id)
        .await?;
    if !proxies.is_empty() {
        return Err(PoolError::Conflict(format!(
            "connector still has {} proxies",
            proxies.len()
        )));
    }

    state
        .store
        .sync_free_proxies(project_id, connector_id, &[], now_ms())
        .await?;
    state.store.remove_connector(project_id, connector_id).await?;

    info!(connector_id = %connector.id, "Deleted connector");
    Ok(StatusCode::NO_CONTENT)
}

/// Switch a connector on or off. The reconciler converges the pool.
pub async fn activate_connector(
    State(state): State<AppState>,
    Path((project_id, connector_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<ActivateRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let mut connector = state.store.get_connector(project_id, connector_id).await?;
    connector.active = req.active;
    connector.updated_ts = now_ms();
    state.store.update_connector(&connector).await?;

    info!(connector_id = %connector.id, active = req.active, "Toggled connector");
    Ok(Json(ConnectorView::from(&connector)))
}

/// Submit an install task
pub async fn install_connector(
    State(state): State<AppState>,
    Path((project_id, connector_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, PoolError> {
    let connector = state.store.get_connector(project_id, connector_id).await?;
    let provider = provider_for(&state, &connector.provider)?;

    if !provider.capabilities().installable {
        return Err(PoolError::Validation(format!(
            "connector type {} cannot be installed",
            connector.provider
        )));
    }
    if connector.installed {
        return Err(PoolError::Conflict("connector is already installed".to_string()));
    }

    let task = state
        .scheduler
        .submit(&connector, TaskKind::Install, json!({}))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TaskView::from(&task))))
}

/// Submit an uninstall task
pub async fn uninstall_connector(
    State(state): State<AppState>,
    Path((project_id, connector_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, PoolError> {
    let connector = state.store.get_connector(project_id, connector_id).await?;
    let provider = provider_for(&state, &connector.provider)?;

    if !provider.capabilities().uninstallable {
        return Err(PoolError::Validation(format!(
            "connector type {} cannot be uninstalled",
            connector.provider
        )));
    }
    if !connector.installed {
        return Err(PoolError::Conflict("connector is not installed".to_string()));
    }
    if connector.active {
        return Err(PoolError::Conflict(
            "deactivate the connector before uninstalling".to_string(),
        ));
    }

    let task = state
        .scheduler
        .submit(&connector, TaskKind::Uninstall, json!({}))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TaskView::from(&task))))
}

#[cfg(test)]
mod tests {
    use crate::api::routes::tests::{call, test_state};
    use crate::models::{Proxy, Task, TaskKind, TaskUpdate};
    use axum::http::{Method, StatusCode};
    use serde_json::{json, Value};
    use uuid::Uuid;

    fn static_connector() -> Value {
        json!({
            "name": "dc",
            "type": "static-datacenter",
            "credential": {},
            "config": { "endpoints": ["10.0.0.1:3128", "10.0.0.2:3128"] },
            "proxiesMax": 2
        })
    }

    #[tokio::test]
    async fn test_connector_crud() {
        let state = test_state();
        let project = Uuid::new_v4();
        let base = format!("/api/projects/{}/connectors", project);

        let (status, created) = call(&state, Method::POST, &base, Some(static_connector())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["provider"], "static-datacenter");
        assert_eq!(created["active"], false);
        assert!(created.get("credential").is_none());
        let id = created["id"].as_str().unwrap().to_string();

        let (status, listed) = call(&state, Method::GET, &base, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let url = format!("{}/{}", base, id);
        let (status, updated) = call(
            &state,
            Method::PUT,
            &url,
            Some(json!({ "name": "renamed", "proxiesMax": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["name"], "renamed");
        assert_eq!(updated["proxiesMax"], 1);

        let (status, activated) = call(
            &state,
            Method::POST,
            &format!("{}/activate", url),
            Some(json!({ "active": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(activated["active"], true);

        let (status, _) = call(&state, Method::DELETE, &url, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&state, Method::GET, &url, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected() {
        let state = test_state();
        let base = format!("/api/projects/{}/connectors", Uuid::new_v4());

        let mut body = static_connector();
        body["config"] = json!({ "endpoints": [] });
        let (status, error) = call(&state, Method::POST, &base, Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error["error"].as_str().unwrap().contains("endpoint"));

        let mut body = static_connector();
        body["type"] = json!("nope");
        let (status, _) = call(&state, Method::POST, &base, Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut body = static_connector();
        body["certificate"] = json!({ "cert": "garbage", "key": "garbage" });
        let (status, _) = call(&state, Method::POST, &base, Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_with_proxies_or_task_conflicts() {
        let state = test_state();
        let project = Uuid::new_v4();
        let base = format!("/api/projects/{}/connectors", project);
        let (_, created) = call(&state, Method::POST, &base, Some(static_connector())).await;
        let connector_id: Uuid = created["id"].as_str().unwrap().parse().unwrap();
        let url = format!("{}/{}", base, connector_id);

        let task = Task::new(project, connector_id, TaskKind::CreateProxies, 1, json!({}), 0);
        state.store.create_task(&task).await.unwrap();
        let (status, _) = call(&state, Method::DELETE, &url, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        state
            .store
            .update_task(project, task.id, TaskUpdate::fail(&task, "stopped"), 1)
            .await
            .unwrap();

        let proxy = Proxy::to_create(project, connector_id, "static-datacenter", 0);
        state.store.create_proxies(&[proxy]).await.unwrap();
        let (status, error) = call(&state, Method::DELETE, &url, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(error["error"].as_str().unwrap().contains("1 proxies"));
    }

    #[tokio::test]
    async fn test_install_requires_installable_provider() {
        let state = test_state();
        let base = format!("/api/projects/{}/connectors", Uuid::new_v4());
        let (_, created) = call(&state, Method::POST, &base, Some(static_connector())).await;
        let url = format!("{}/{}/install", base, created["id"].as_str().unwrap());

        let (status, _) = call(&state, Method::POST, &url, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_install_submits_task() {
        let state = test_state();
        let project = Uuid::new_v4();
        let base = format!("/api/projects/{}/connectors", project);
        let body = json!({
            "name": "local",
            "type": "datacenter-local",
            "credential": { "apiKey": "key" },
            "config": { "region": "eu-west", "ingress": "127.0.0.1:3129" },
            "proxiesMax": 1
        });
        let (status, created) = call(&state, Method::POST, &base, Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        let url = format!("{}/{}/install", base, created["id"].as_str().unwrap());

        let (status, task) = call(&state, Method::POST, &url, None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(task["kind"], "install");
        assert_eq!(task["running"], true);
        assert!(task.get("jwt").is_none());
        assert!(task.get("data").is_none());

        let (status, _) = call(&state, Method::POST, &url, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
