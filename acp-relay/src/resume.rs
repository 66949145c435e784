//! Resume Coordinator (SPEC_FULL.md §4.G).
//!
//! Re-attaches a client to an already-known session id without creating
//! a new sandbox. The single-shot correlation entry (a `tokio::sync::oneshot`
//! pair stored in the Pending Request table) is the same primitive the
//! teacher uses for `SessionManager::send_request`'s response
//! correlation; the 5s deadline mirrors that call's `tokio::time::timeout`.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::router::{PendingEntry, Router};
use crate::rpc::{self, ERROR_BAD_PARAMS, ERROR_SESSION};

/// Deadline for a resume round trip (§4.G, §5).
pub const RESUME_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn handle_resume(
    router: &Router,
    client_id: Value,
    params: Value,
    outbound: mpsc::Sender<Value>,
    subscribed_sessions: &mut HashSet<String>,
) {
    let Some(session_id) = params.get("sessionId").and_then(Value::as_str).map(str::to_string) else {
        reply_error(&outbound, client_id, ERROR_BAD_PARAMS, "missing sessionId").await;
        return;
    };

    let pending = router.pending();
    let registry = router.registry();

    let resume_id = pending.alloc_id();
    let (tx, rx) = oneshot::channel();
    pending.insert(resume_id.to_string(), PendingEntry::OneShot(tx));

    let frame = json!({
        "jsonrpc": "2.0",
        "method": "session/resume",
        "id": resume_id,
        "params": {"sessionId": session_id},
    });

    if let Err(err) = registry.send_to_session(&session_id, frame).await {
        pending.remove(&resume_id.to_string());
        reply_error(&outbound, client_id, ERROR_SESSION, err.to_string()).await;
        return;
    }

    match tokio::time::timeout(RESUME_TIMEOUT, rx).await {
        Ok(Ok(frame)) => {
            if let Some(error) = frame.get("error") {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("resume failed")
                    .to_string();
                reply_error(&outbound, client_id, ERROR_SESSION, message).await;
                return;
            }
            router.ensure_subscribed(&session_id, outbound.clone(), subscribed_sessions);
            let result = frame.get("result").cloned().unwrap_or(Value::Null);
            let reply = json!({"jsonrpc": "2.0", "id": client_id, "result": result});
            let _ = outbound.send(reply).await;
        }
        Ok(Err(_)) => {
            reply_error(&outbound, client_id, ERROR_SESSION, "resume channel closed before a reply arrived").await;
        }
        Err(_) => {
            pending.remove(&resume_id.to_string());
            reply_error(&outbound, client_id, ERROR_SESSION, "resume timeout").await;
        }
    }
}

async fn reply_error(outbound: &mpsc::Sender<Value>, id: Value, code: i32, message: impl Into<String>) {
    let frame = json!({"jsonrpc": "2.0", "id": id, "error": rpc::error_object(code, message)});
    let _ = outbound.send(frame).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use crate::sandbox::{CliContainerEngine, SandboxManager};
    use crate::storage::Storage;
    use std::sync::Arc;

    fn test_router() -> Router {
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
        let registry = Arc::new(SessionRegistry::new(storage, sandboxes, 500));
        Router::new(registry, Arc::new(crate::router::PendingRequests::new()))
    }

    #[tokio::test]
    async fn resume_with_unknown_session_reports_session_error() {
        let router = test_router();
        let mut subscribed = HashSet::new();
        let (tx, mut rx) = mpsc::channel(4);
        handle_resume(
            &router,
            json!(1),
            json!({"sessionId": "nonexistent"}),
            tx,
            &mut subscribed,
        )
        .await;
        let reply = rx.recv().await.unwrap();
        assert!(reply.get("error").is_some());
        assert!(subscribed.is_empty());
    }

    #[tokio::test]
    async fn resume_missing_session_id_is_bad_params() {
        let router = test_router();
        let mut subscribed = HashSet::new();
        let (tx, mut rx) = mpsc::channel(4);
        handle_resume(&router, json!(1), json!({}), tx, &mut subscribed).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply["error"]["code"], json!(ERROR_BAD_PARAMS));
    }
}
