//! Task handlers. Views never expose task data or tokens.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use uuid::Uuid;

use crate::api::server::AppState;
use crate::error::PoolError;
use crate::models::TaskView;

pub async fn list_tasks(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<impl IntoResponse, PoolError> {
    let tasks = state.store.list_tasks(project_id).await?;
    let views: Vec<TaskView> = tasks.iter().map(TaskView::from).collect();
    Ok(Json(views))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path((project_id, task_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, PoolError> {
    let task = state.store.get_task(project_id, task_id).await?;
    Ok(Json(TaskView::from(&task)))
}

/// Request cancellation of a running task
pub async fn cancel_task(
    State(state): State<AppState>,
    Path((project_id, task_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, PoolError> {
    let task = state.scheduler.cancel(project_id, task_id).await?;
    Ok(Json(TaskView::from(&task)))
}

#[cfg(test)]
mod tests {
    use crate::api::routes::tests::{call, test_state};
    use crate::models::{Task, TaskKind};
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_task_views_and_cancel() {
        let state = test_state();
        let project = Uuid::new_v4();
        let task = Task::new(
            project,
            Uuid::new_v4(),
            TaskKind::RemoveProxies,
            2,
            json!({ "proxyIds": [] }),
            0,
        );
        state.store.create_task(&task).await.unwrap();

        let base = format!("/api/projects/{}/tasks", project);
        let (status, listed) = call(&state, Method::GET, &base, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed[0]["kind"], "remove-proxies");
        assert!(listed[0].get("data").is_none());

        let url = format!("{}/{}", base, task.id);
        let (status, cancelled) = call(&state, Method::POST, &format!("{}/cancel", url), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["cancelled"], true);

        let (status, _) = call(
            &state,
            Method::GET,
            &format!("{}/{}", base, Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(
            &state,
            Method::GET,
            &format!("/api/projects/{}/tasks/{}", Uuid::new_v4(), task.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
