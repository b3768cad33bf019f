use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use volumed_engine::OperationEngine;
use volumed_store::StateStore;

use crate::auth::require_bearer_token;
use crate::handlers;
use crate::state::AppState;

pub fn build_app(engine: Arc<OperationEngine>, store: Arc<dyn StateStore>, auth_token: Option<Arc<String>>) -> Router {
    let state = AppState { engine, store, auth_token };

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/volumes", post(handlers::create_volume).get(handlers::list_volumes))
        .route("/api/v1/volumes/:id", axum::routing::delete(handlers::delete_volume))
        .route("/api/v1/volumes/:id/attach", post(handlers::attach_volume))
        .route("/api/v1/volumes/:id/attach-root", post(handlers::attach_volume_as_root))
        .route("/api/v1/volumes/:id/detach", post(handlers::detach_volume))
        .route("/api/v1/volumes/:id/reattach", post(handlers::reattach_volume))
        .route("/api/v1/operations/:id", get(handlers::get_operation))
        .route("/api/v1/operations", get(handlers::list_operations))
        .route("/status", get(handlers::status))
        .route("/events", get(handlers::list_events))
        .route("/diverged", get(handlers::list_diverged))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use nix::sys::signal::Signal;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;
    use volumed_cloud::{CloudBackend, CloudClient, LocalCloudBackend};
    use volumed_devices::{DeviceCorrelator, DeviceError};
    use volumed_engine::EngineTimeouts;
    use volumed_nbd::{NbdExportManager, ServerLocator};
    use volumed_store::InMemoryStore;

    use super::*;

    struct NoDevices;

    #[async_trait::async_trait]
    impl DeviceCorrelator for NoDevices {
        async fn match_new_device(
            &self,
            _expected_size: u64,
            _since: chrono::DateTime<chrono::Utc>,
            _excluded: &[String],
            _timeout: Duration,
        ) -> Result<Option<String>, DeviceError> {
            Ok(None)
        }

        async fn is_present(&self, _device_path: &str) -> bool {
            false
        }
    }

    fn test_app() -> Router {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let backend: Arc<dyn CloudBackend> = Arc::new(LocalCloudBackend::new());
        let cloud = Arc::new(CloudClient::new(backend));
        let dir = tempfile::tempdir().unwrap();
        let nbd = Arc::new(NbdExportManager::new(
            dir.path().join("exports.conf"),
            ServerLocator::ProcessName("nbd-server-that-does-not-exist".into()),
            Signal::SIGHUP,
            store.clone(),
        ));
        let devices: Arc<dyn DeviceCorrelator> = Arc::new(NoDevices);
        let timeouts = EngineTimeouts { cloud_call: Duration::from_secs(5), correlation_window: Duration::from_millis(50) };
        let engine = Arc::new(OperationEngine::new(store.clone(), cloud, devices, nbd, timeouts, 10809));
        build_app(engine, store, Some(Arc::new("test-token".to_string())))
    }

    fn authed(req: axum::http::request::Builder) -> axum::http::request::Builder {
        req.header("Authorization", "Bearer test-token")
    }

    #[tokio::test]
    async fn unauthenticated_request_is_rejected() {
        let app = test_app();
        let resp = app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_returns_200() {
        let app = test_app();
        let resp = app.oneshot(authed(Request::builder().uri("/health")).body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_volume_returns_202_with_operation_record() {
        let app = test_app();
        let body = json!({"size": 1024, "name": "v1", "pool": "p1"});
        let resp = app
            .oneshot(
                authed(Request::builder().method("POST").uri("/api/v1/volumes").header("content-type", "application/json"))
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let op: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(op["status"], "completed");
    }

    #[tokio::test]
    async fn attach_with_no_device_times_out_and_returns_202_with_failed_op() {
        let app = test_app();
        let create_body = json!({"size": 1024, "name": "v1", "pool": "p1"});
        let resp = app
            .clone()
            .oneshot(
                authed(Request::builder().method("POST").uri("/api/v1/volumes").header("content-type", "application/json"))
                    .body(Body::from(create_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let op: Value = serde_json::from_slice(&bytes).unwrap();
        let volume_id = op["response"]["volume_id"].as_str().unwrap();

        let attach_body = json!({"host-id": "h1"});
        let resp = app
            .oneshot(
                authed(
                    Request::builder()
                        .method("POST")
                        .uri(format!("/api/v1/volumes/{volume_id}/attach"))
                        .header("content-type", "application/json"),
                )
                .body(Body::from(attach_body.to_string()))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let op: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(op["status"], "failed");
        assert_eq!(op["error"]["kind"], "correlation-timeout");
    }

    #[tokio::test]
    async fn get_unknown_operation_returns_404() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri(format!("/api/v1/operations/{}", uuid::Uuid::new_v4()))).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_returns_200() {
        let app = test_app();
        let resp = app.oneshot(authed(Request::builder().uri("/status")).body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
