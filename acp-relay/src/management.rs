//! Management API (SPEC_FULL.md §4.F).
//!
//! Ground: `axum` router construction with `tower_http::trace::TraceLayer`
//! and `CorsLayer`, modeled on `ahma_http_bridge::bridge::start_bridge`;
//! the `/healthz` route follows the same idiom as the teacher's
//! `health_check`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::Stream;
use serde_json::json;
use tokio_stream::StreamExt as _;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::registry::{LifecycleEvent, SessionRegistry};

struct ManagementState {
    registry: Arc<SessionRegistry>,
}

/// Builds the Management API router: `GET /api/sessions`,
/// `GET /api/sessions/:id/messages`, `GET /api/sessions/stream` (the live
/// session feed, §6.1), `GET /healthz`. Read-only, no authentication;
/// callers bind it to loopback only by default (§4.F).
pub fn router(registry: Arc<SessionRegistry>) -> Router {
    let state = Arc::new(ManagementState { registry });
    Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/stream", get(stream_sessions))
        .route("/api/sessions/:id/messages", get(session_messages))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn list_sessions(State(state): State<Arc<ManagementState>>) -> Response {
    Json(state.registry.list()).into_response()
}

async fn session_messages(State(state): State<Arc<ManagementState>>, Path(id): Path<String>) -> Response {
    Json(state.registry.messages(&id)).into_response()
}

/// Server-sent events of session-created/session-closed transitions
/// (§6.1), the same `BroadcastStream`-to-`Event` mapping the teacher uses
/// for its `/sse` route.
async fn stream_sessions(
    State(state): State<Arc<ManagementState>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = state.registry.subscribe_lifecycle();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).map(|event| match event {
        Ok(event) => {
            let name = match event {
                LifecycleEvent::Created(_) => "created",
                LifecycleEvent::Closed(_) => "closed",
            };
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Ok(Event::default().event(name).data(data))
        }
        Err(_) => Ok(Event::default().comment("missed lifecycle events")),
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn healthz(State(state): State<Arc<ManagementState>>) -> Response {
    (
        StatusCode::OK,
        Json(json!({"status": "ok", "activeSessions": state.registry.active_count()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{CliContainerEngine, SandboxManager};
    use crate::storage::Storage;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_registry() -> Arc<SessionRegistry> {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let sandboxes = Arc::new(SandboxManager::new(
            Arc::new(CliContainerEngine),
            crate::config::AgentConfig {
                command: "agent".into(),
                mode: crate::config::AgentMode::Container,
                args: vec![],
                env: Default::default(),
                startup_timeout_seconds: 30,
                max_concurrent_sessions: 4,
                container: None,
            },
        ));
        Arc::new(SessionRegistry::new(storage, sandboxes, 500))
    }

    #[tokio::test]
    async fn healthz_reports_zero_active_sessions_when_empty() {
        let app = router(test_registry());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sessions_list_is_empty_json_array_initially() {
        let app = router(test_registry());
        let response = app
            .oneshot(Request::builder().uri("/api/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn messages_for_unknown_session_is_an_empty_array() {
        let app = router(test_registry());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/nonexistent/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"[]");
    }

    #[tokio::test]
    async fn stream_endpoint_responds_with_event_stream_content_type() {
        let app = router(test_registry());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
    }
}
