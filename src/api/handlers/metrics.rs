//! Pool metrics endpoint

use axum::extract::State;
use axum::Json;
use serde_json::Value;

use crate::api::server::AppState;
use crate::error::PoolError;

/// Latest snapshot published by the metrics refresh loop
pub async fn get_metrics(State(state): State<AppState>) -> Result<Json<Value>, PoolError> {
    let snapshot = state.metrics.snapshot();
    Ok(Json(serde_json::to_value(snapshot.as_ref())?))
}

#[cfg(test)]
mod tests {
    use crate::api::routes::tests::{call, test_state};
    use axum::http::{Method, StatusCode};

    #[tokio::test]
    async fn test_metrics_snapshot_after_collect() {
        let state = test_state();
        let (status, body) = call(&state, Method::GET, "/api/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["generatedTs"], 0);

        state.metrics.collect().await.unwrap();
        let (_, body) = call(&state, Method::GET, "/api/metrics", None).await;
        assert!(body["generatedTs"].as_i64().unwrap() > 0);
        assert_eq!(body["runningTasks"], 0);
    }
}
