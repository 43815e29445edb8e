//! Project pool policy handlers

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::api::server::AppState;
use crate::error::PoolError;
use crate::models::{now_ms, DelayRange, Project, ProjectStatus};

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub connector_default_id: Option<Uuid>,
    pub proxies_min: Option<u32>,
    pub auto_rotate: Option<bool>,
    pub auto_rotate_delay_range: Option<DelayRange>,
    pub auto_scale_up: Option<bool>,
    pub auto_scale_down: Option<bool>,
    pub auto_scale_down_delay: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub status: ProjectStatus,
}

async fn load(state: &AppState, project_id: Uuid) -> Result<Project, PoolError> {
    state
        .store
        .get_project(project_id)
        .await?
        .ok_or(PoolError::ProjectNotFound { id: project_id })
}

/// Get the pool policy of a project
pub async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<impl IntoResponse, PoolError> {
    Ok(Json(load(&state, project_id).await?))
}

/// Create or update the pool policy of a project
pub async fn update_project(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let now = now_ms();
    let mut project = match state.store.get_project(project_id).await? {
        Some(project) => project,
        None => Project::new(project_id, "", now),
    };

    if let Some(name) = req.name {
        project.name = name.trim().to_string();
    }
    if let Some(connector_id) = req.connector_default_id {
        state
            .store
            .get_connector(project_id, connector_id)
            .await
            .map_err(|_| {
                PoolError::Validation(format!("connector {} does not exist", connector_id))
            })?;
        project.connector_default_id = Some(connector_id);
    }
    if let Some(proxies_min) = req.proxies_min {
        project.proxies_min = proxies_min;
    }
    if let Some(auto_rotate) = req.auto_rotate {
        project.auto_rotate = auto_rotate;
    }
    if let Some(range) = req.auto_rotate_delay_range {
        project.auto_rotate_delay_range = range;
    }
    if let Some(auto_scale_up) = req.auto_scale_up {
        project.auto_scale_up = auto_scale_up;
    }
    if let Some(auto_scale_down) = req.auto_scale_down {
        project.auto_scale_down = auto_scale_down;
    }
    if let Some(delay) = req.auto_scale_down_delay {
        project.auto_scale_down_delay = delay;
    }
    project.validate()?;
    project.updated_ts = now;

    state.store.save_project(&project).await?;
    info!(project_id = %project_id, status = %project.status, "Project updated");
    Ok(Json(project))
}

/// Switch a project between off, calm and hot
pub async fn set_project_status(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(req): Json<SetStatusRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let mut project = load(&state, project_id).await?;
    if project.set_status(req.status, now_ms()) {
        state.store.save_project(&project).await?;
        info!(project_id = %project_id, status = %project.status, "Project status set");
    }
    Ok(Json(project))
}

#[cfg(test)]
mod tests {
    use crate::api::routes::tests::{call, test_state};
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_project_policy_lifecycle() {
        let state = test_state();
        let url = format!("/api/projects/{}", Uuid::new_v4());

        let (status, _) = call(&state, Method::GET, &url, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, created) = call(
            &state,
            Method::PUT,
            &url,
            Some(json!({
                "name": "crawler",
                "proxiesMin": 2,
                "autoRotate": true,
                "autoRotateDelayRange": { "min": 60000, "max": 120000 }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["status"], "hot");
        assert_eq!(created["proxiesMin"], 2);
        assert_eq!(created["autoRotateDelayRange"]["max"], 120000);

        let (status, calm) = call(
            &state,
            Method::POST,
            &format!("{}/status", url),
            Some(json!({ "status": "calm" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(calm["status"], "calm");

        let (status, fetched) = call(&state, Method::GET, &url, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["status"], "calm");
        assert_eq!(fetched["name"], "crawler");
    }

    #[tokio::test]
    async fn test_invalid_policy_is_rejected() {
        let state = test_state();
        let url = format!("/api/projects/{}", Uuid::new_v4());

        let (status, _) = call(
            &state,
            Method::PUT,
            &url,
            Some(json!({ "name": "p", "autoScaleDownDelay": 10 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            Method::PUT,
            &url,
            Some(json!({ "name": "p", "connectorDefaultId": Uuid::new_v4() })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            Method::POST,
            &format!("{}/status", url),
            Some(json!({ "status": "hot" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
