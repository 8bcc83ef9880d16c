//! HTTP routes served by the worker.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use resilient_session::{ChannelError, SessionKey, WorkerHandle};

/// What the routes need from the session.
pub trait SessionControl: Send + Sync {
    fn session_key(&self) -> &SessionKey;

    fn kill_session(&self, reason: &str) -> Result<(), ChannelError>;
}

impl SessionControl for WorkerHandle {
    fn session_key(&self) -> &SessionKey {
        WorkerHandle::session_key(self)
    }

    fn kill_session(&self, reason: &str) -> Result<(), ChannelError> {
        WorkerHandle::kill_session(self, reason, true, 0)
    }
}

pub fn routes(session: Arc<dyn SessionControl>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/kill/{key}", get(kill).post(kill))
        .with_state(session)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn kill(
    State(session): State<Arc<dyn SessionControl>>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    if !session.session_key().matches(&key) {
        tracing::warn!("Remote kill rejected: wrong session key");
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "invalid session key" })),
        );
    }

    tracing::info!("Remote kill requested");
    match session.kill_session("remote kill requested over HTTP") {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "killed": true }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct FakeSession {
        key: SessionKey,
        kills: Mutex<Vec<String>>,
        destroyed: bool,
    }

    impl FakeSession {
        fn new(destroyed: bool) -> Arc<Self> {
            Arc::new(Self {
                key: SessionKey::from("secret"),
                kills: Mutex::new(Vec::new()),
                destroyed,
            })
        }
    }

    impl SessionControl for FakeSession {
        fn session_key(&self) -> &SessionKey {
            &self.key
        }

        fn kill_session(&self, reason: &str) -> Result<(), ChannelError> {
            if self.destroyed {
                return Err(ChannelError::Destroyed);
            }
            self.kills.lock().unwrap().push(reason.to_string());
            Ok(())
        }
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_route_answers_ok() {
        let app = routes(FakeSession::new(false));
        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn kill_with_correct_key_ends_session() {
        let session = FakeSession::new(false);
        let app = routes(Arc::clone(&session) as Arc<dyn SessionControl>);
        let response = app
            .oneshot(Request::post("/kill/secret").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(session.kills.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn kill_with_wrong_key_is_forbidden() {
        let session = FakeSession::new(false);
        let app = routes(Arc::clone(&session) as Arc<dyn SessionControl>);
        let response = app
            .oneshot(Request::get("/kill/guess").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(session.kills.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn kill_after_teardown_is_unavailable() {
        let app = routes(FakeSession::new(true));
        let response = app
            .oneshot(Request::get("/kill/secret").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
