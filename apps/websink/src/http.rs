use std::path::Path;

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tower_http::{services::ServeDir, trace::TraceLayer};
use websink_signaling::SessionRegistry;

#[derive(Clone)]
pub struct HttpState {
    ws_port: u16,
    registry: SessionRegistry,
    metrics: PrometheusHandle,
}

impl HttpState {
    pub fn new(ws_port: u16, registry: SessionRegistry, metrics: PrometheusHandle) -> Self {
        Self {
            ws_port,
            registry,
            metrics,
        }
    }
}

/// What the viewer page needs to find the signaling socket.
#[derive(Debug, Serialize)]
struct ViewerConfig {
    ws_port: u16,
}

pub fn router(state: HttpState, static_dir: Option<&Path>) -> Router {
    let router = Router::new()
        .route("/api/config", get(config_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let router = match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };
    router.layer(TraceLayer::new_for_http())
}

async fn config_handler(State(state): State<HttpState>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "no-cache")],
        Json(ViewerConfig {
            ws_port: state.ws_port,
        }),
    )
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "sessions": state.registry.len() }))
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::Value;
    use tower::ServiceExt;

    fn state() -> HttpState {
        let metrics = PrometheusBuilder::new().build_recorder().handle();
        HttpState::new(8765, SessionRegistry::new(), metrics)
    }

    async fn fetch(router: Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    #[test_timeout::timeout]
    async fn config_reports_signaling_port() {
        let (status, headers, body) = fetch(router(state(), None), "/api/config").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({ "ws_port": 8765 }));
    }

    #[test_timeout::timeout]
    async fn health_reports_session_count() {
        let (status, _, body) = fetch(router(state(), None), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({ "status": "ok", "sessions": 0 }));
    }

    #[test_timeout::timeout]
    async fn metrics_are_plain_text() {
        let (status, headers, _) = fetch(router(state(), None), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }

    #[test_timeout::timeout]
    async fn serves_viewer_page_from_static_dir() {
        let dir = std::env::temp_dir().join(format!("websink-static-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), "<html>viewer</html>").unwrap();

        let (status, _, body) = fetch(router(state(), Some(&dir)), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"<html>viewer</html>");

        let (status, _, _) = fetch(router(state(), Some(&dir)), "/missing.js").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = fetch(router(state(), None), "/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
