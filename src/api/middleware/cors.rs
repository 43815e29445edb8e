//! CORS middleware configuration
//!
//! Origins come from `CORS_ORIGINS`; without any the dashboard dev server on
//! localhost is the only allowed origin.

use axum::http::{HeaderValue, Method};
use axum::http::header;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

const ALLOWED_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
];

/// Create a CORS layer with the specified allowed origins
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(ALLOWED_METHODS)
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    if allowed_origins.is_empty() {
        debug!("CORS: No origins specified, allowing localhost only");
        return layer.allow_origin([
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
        ]);
    }

    debug!("CORS: Allowing origins: {:?}", allowed_origins);
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(origin) => Some(origin),
            Err(_) => {
                warn!("CORS: ignoring invalid origin {:?}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use tower::ServiceExt;

    /// `access-control-allow-origin` answered for a request from `origin`.
    async fn allowed_origin(origins: &[String], method: Method, origin: &str) -> Option<String> {
        let app = axum::Router::new()
            .route("/api/metrics", get(|| async { "{}" }))
            .layer(cors_layer(origins));

        let mut request = Request::builder()
            .method(method.clone())
            .uri("/api/metrics")
            .header(header::ORIGIN, origin);
        if method == Method::OPTIONS {
            request = request.header(header::ACCESS_CONTROL_REQUEST_METHOD, "PUT");
        }

        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .map(|v| v.to_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn test_default_origins_are_local_only() {
        assert_eq!(
            allowed_origin(&[], Method::GET, "http://127.0.0.1:3000").await.as_deref(),
            Some("http://127.0.0.1:3000")
        );
        assert!(allowed_origin(&[], Method::GET, "https://pool.example.com")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_configured_origins_skip_invalid_entries() {
        let origins = vec![
            "https://ops.example.com".to_string(),
            "bad\norigin".to_string(),
        ];

        assert_eq!(
            allowed_origin(&origins, Method::GET, "https://ops.example.com").await.as_deref(),
            Some("https://ops.example.com")
        );
        assert!(allowed_origin(&origins, Method::GET, "http://localhost:3000")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_preflight_for_connector_update() {
        let origins = vec!["https://ops.example.com".to_string()];
        assert_eq!(
            allowed_origin(&origins, Method::OPTIONS, "https://ops.example.com").await.as_deref(),
            Some("https://ops.example.com")
        );
    }
}
