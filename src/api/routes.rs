//! API route definitions

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::server::AppState;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/api/metrics", get(handlers::metrics::get_metrics))
        .nest("/api/projects/:project_id", project_routes())
        .with_state(state)
}

/// Routes scoped to one project
fn project_routes() -> Router<AppState> {
    Router::new()
        // Pool policy
        .route(
            "/",
            get(handlers::projects::get_project).put(handlers::projects::update_project),
        )
        .route("/status", post(handlers::projects::set_project_status))
        // Connectors
        .route(
            "/connectors",
            get(handlers::connectors::list_connectors).post(handlers::connectors::create_connector),
        )
        .route(
            "/connectors/:connector_id",
            get(handlers::connectors::get_connector)
                .put(handlers::connectors::update_connector)
                .delete(handlers::connectors::delete_connector),
        )
        .route(
            "/connectors/:connector_id/activate",
            post(handlers::connectors::activate_connector),
        )
        .route(
            "/connectors/:connector_id/install",
            post(handlers::connectors::install_connector),
        )
        .route(
            "/connectors/:connector_id/uninstall",
            post(handlers::connectors::uninstall_connector),
        )
        // Proxies
        .route(
            "/connectors/:connector_id/proxies",
            get(handlers::proxies::list_proxies),
        )
        .route(
            "/connectors/:connector_id/proxies/remove",
            post(handlers::proxies::remove_proxies),
        )
        // Tasks
        .route("/tasks", get(handlers::tasks::list_tasks))
        .route("/tasks/:task_id", get(handlers::tasks::get_task))
        .route("/tasks/:task_id/cancel", post(handlers::tasks::cancel_task))
}
