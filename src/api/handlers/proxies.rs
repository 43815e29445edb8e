//! Proxy handlers

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::api::server::AppState;
use crate::error::PoolError;
use crate::models::{ProxyStatus, ProxyView};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveProxiesRequest {
    pub proxy_ids: Vec<Uuid>,
}

/// List a connector's proxies
pub async fn list_proxies(
    State(state): State<AppState>,
    Path((project_id, connector_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, PoolError> {
    // 404 for unknown connectors instead of an empty list
    state.store.get_connector(project_id, connector_id).await?;

    let proxies = state
        .store
        .list_connector_proxies(project_id, connector_id)
        .await?;
    let views: Vec<ProxyView> = proxies.iter().map(ProxyView::from).collect();
    Ok(Json(views))
}

/// Flag proxies for removal. The reconciler submits the remove task.
pub async fn remove_proxies(
    State(state): State<AppState>,
    Path((project_id, connector_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<RemoveProxiesRequest>,
) -> Result<impl IntoResponse, PoolError> {
    if req.proxy_ids.is_empty() {
        return Err(PoolError::Validation("proxyIds must not be empty".to_string()));
    }
    state.store.get_connector(project_id, connector_id).await?;

    let proxies = state.store.get_proxies(project_id, &req.proxy_ids).await?;
    if let Some(missing) = req
        .proxy_ids
        .iter()
        .find(|id| !proxies.iter().any(|p| p.id == **id && p.connector_id == connector_id))
    {
        return Err(PoolError::ProxyNotFound { id: *missing });
    }

    let mut flagged = 0;
    for mut proxy in proxies {
        if proxy.status.is_removal() {
            continue;
        }
        let expected = proxy.status;
        proxy.transition(ProxyStatus::ToRemove)?;
        if state.store.update_proxy(&proxy, expected).await? {
            flagged += 1;
        }
    }

    info!(connector_id = %connector_id, flagged, "Proxies flagged for removal");
    Ok(Json(json!({ "flagged": flagged })))
}

#[cfg(test)]
mod tests {
    use crate::api::routes::tests::{call, test_state};
    use crate::models::{Connector, Proxy, ProxyStatus};
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_list_and_flag_proxies() {
        let state = test_state();
        let connector = Connector::new(
            Uuid::new_v4(),
            "dc",
            "static-datacenter",
            json!({}),
            json!({ "endpoints": ["10.0.0.1:3128"] }),
            2,
            0,
        );
        state.store.create_connector(&connector).await.unwrap();

        let mut started = Proxy::to_create(connector.project_id, connector.id, "static-datacenter", 0);
        started.status = ProxyStatus::Started;
        started.config = Some(json!({ "address": "10.0.0.1:3128" }));
        let mut removing = Proxy::to_create(connector.project_id, connector.id, "static-datacenter", 0);
        removing.status = ProxyStatus::Removing;
        state
            .store
            .create_proxies(&[started.clone(), removing.clone()])
            .await
            .unwrap();

        let base = format!(
            "/api/projects/{}/connectors/{}/proxies",
            connector.project_id, connector.id
        );
        let (status, listed) = call(&state, Method::GET, &base, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 2);
        assert!(listed[0].get("config").is_none());

        let (status, body) = call(
            &state,
            Method::POST,
            &format!("{}/remove", base),
            Some(json!({ "proxyIds": [started.id, removing.id] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["flagged"], 1);

        let stored = state
            .store
            .get_proxies(connector.project_id, &[started.id, removing.id])
            .await
            .unwrap();
        let status_of = |id: Uuid| stored.iter().find(|p| p.id == id).unwrap().status;
        assert_eq!(status_of(started.id), ProxyStatus::ToRemove);
        assert_eq!(status_of(removing.id), ProxyStatus::Removing);

        let (status, _) = call(
            &state,
            Method::POST,
            &format!("{}/remove", base),
            Some(json!({ "proxyIds": [Uuid::new_v4()] })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
