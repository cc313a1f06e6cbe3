//! Admin HTTP server for a replica.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness probe
//! - `GET /api/v1/status` - Replica name, processor state, and open scope count
//! - `PUT /api/v1/status/start` - Start admitting work
//! - `PUT /api/v1/status/stop` - Request drain-and-stop
//! - `POST /api/v1/work-items` - Enqueue a raw work item (returns 202 Accepted)

use std::sync::Arc;

pub mod health;
pub mod status;
pub mod work_items;

pub use health::health_handler;
pub use status::{StatusError, StatusResponse, start_handler, status_handler, stop_handler};
pub use work_items::{SubmitError, SubmitResponse, submit_handler};

use crate::cache::KeyValueStore;
use crate::processor::ProcessorRegistry;
use crate::state::ReplicaState;
use crate::worker::WorkQueue;

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
pub struct AppState<S: KeyValueStore, Q: WorkQueue> {
    inner: Arc<AppStateInner<S, Q>>,
}

struct AppStateInner<S: KeyValueStore, Q: WorkQueue> {
    state: Arc<ReplicaState<S>>,
    registry: ProcessorRegistry,
    queue: Arc<Q>,
}

impl<S: KeyValueStore, Q: WorkQueue> Clone for AppState<S, Q> {
    fn clone(&self) -> Self {
        AppState {
            inner: self.inner.clone(),
        }
    }
}

impl<S: KeyValueStore, Q: WorkQueue> AppState<S, Q> {
    pub fn new(state: Arc<ReplicaState<S>>, registry: ProcessorRegistry, queue: Arc<Q>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                state,
                registry,
                queue,
            }),
        }
    }

    pub fn state(&self) -> &Arc<ReplicaState<S>> {
        &self.inner.state
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.inner.registry
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.inner.queue
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<S: KeyValueStore, Q: WorkQueue>(app_state: AppState<S, Q>) -> axum::Router {
    use axum::routing::{get, post, put};

    axum::Router::new()
        .route("/health", get(health_handler::<S, Q>))
        .route("/api/v1/status", get(status_handler::<S, Q>))
        .route("/api/v1/status/start", put(start_handler::<S, Q>))
        .route("/api/v1/status/stop", put(stop_handler::<S, Q>))
        .route("/api/v1/work-items", post(submit_handler::<S, Q>))
        .with_state(app_state)
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::cache::InMemoryStore;
    use crate::processor::{HeartbeatProcessor, HeartbeatWorkItem};
    use crate::state::ProcessorState;
    use crate::types::{ReplicaId, encode_work_item};
    use crate::worker::InMemoryQueue;

    type TestState = AppState<InMemoryStore, InMemoryQueue>;

    async fn test_app_state() -> TestState {
        let store = Arc::new(InMemoryStore::new());
        let state = Arc::new(ReplicaState::new(ReplicaId::new("replica-1"), store));
        state.mark_initializing_done().await.unwrap();
        let registry = ProcessorRegistry::builder()
            .register_default::<HeartbeatWorkItem, HeartbeatProcessor>()
            .build()
            .unwrap();
        AppState::new(state, registry, Arc::new(InMemoryQueue::new()))
    }

    fn request(method: &str, uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(body.into())
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    // ─── Health endpoint tests ───

    #[tokio::test]
    async fn health_returns_200() {
        let app = build_router(test_app_state().await);

        let response = app
            .oneshot(request("GET", "/health", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn health_returns_503_after_dispose() {
        let app_state = test_app_state().await;
        app_state.state().dispose();
        let app = build_router(app_state);

        let response = app
            .oneshot(request("GET", "/health", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    // ─── Status endpoint tests ───

    #[tokio::test]
    async fn status_reports_replica_and_state() {
        let app = build_router(test_app_state().await);

        let response = app
            .oneshot(request("GET", "/api/v1/status", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["replica"], "replica-1");
        assert_eq!(json["state"], "Stopped");
        assert_eq!(json["open_scopes"], 0);
    }

    #[tokio::test]
    async fn start_then_stop() {
        let app_state = test_app_state().await;
        let app = build_router(app_state.clone());

        let response = app
            .clone()
            .oneshot(request("PUT", "/api/v1/status/start", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["state"], "Working");
        assert_eq!(app_state.state().state(), ProcessorState::Working);

        let response = app
            .oneshot(request("PUT", "/api/v1/status/stop", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["state"], "Stopped");
    }

    #[tokio::test]
    async fn start_before_initialization_is_conflict() {
        let store = Arc::new(InMemoryStore::new());
        let state = Arc::new(ReplicaState::new(ReplicaId::new("r"), store));
        let registry = ProcessorRegistry::builder().build().unwrap();
        let app = build_router(AppState::new(
            state,
            registry,
            Arc::new(InMemoryQueue::new()),
        ));

        let response = app
            .oneshot(request("PUT", "/api/v1/status/start", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    // ─── Work item endpoint tests ───

    #[tokio::test]
    async fn submit_known_type_returns_202_and_enqueues() {
        let app_state = test_app_state().await;
        let app = build_router(app_state.clone());
        let payload = encode_work_item(&HeartbeatWorkItem::now()).unwrap();

        let response = app
            .oneshot(request("POST", "/api/v1/work-items", payload.clone()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            body_json(response).await["work_item_type"],
            "HeartbeatWorkItem"
        );

        let queued = app_state
            .queue()
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.body, payload);
    }

    #[tokio::test]
    async fn submit_unknown_type_returns_400() {
        let app = build_router(test_app_state().await);

        let response = app
            .oneshot(request(
                "POST",
                "/api/v1/work-items",
                r#"{"type":"MysteryWorkItem"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submit_malformed_json_returns_400() {
        let app = build_router(test_app_state().await);

        let response = app
            .oneshot(request("POST", "/api/v1/work-items", "{not json"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
