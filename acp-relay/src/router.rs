//! Session Router (SPEC_FULL.md §4.E).
//!
//! Ground: one reader task, one writer task, bounded mpsc queues per
//! WebSocket connection — the same channel shape as
//! `ahma_http_bridge::bridge`'s inbound `mpsc::Receiver<Value>` feeding
//! `manage_process` and its outbound `broadcast::Sender<String>` feeding
//! SSE subscribers, generalized here to a real duplex per client instead
//! of one shared subprocess.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::registry::SessionRegistry;
use crate::rpc::{self, ClientRequestMethod, FrameKind, ERROR_BAD_PARAMS, ERROR_SESSION, ERROR_UNKNOWN_METHOD};

/// Inbound/outbound queue depth per connection (§4.E, §5).
pub const QUEUE_CAPACITY: usize = 1024;

/// What a pending relay-side id correlates to (§3 "Pending Request").
pub enum PendingEntry {
    /// A request this router forwarded from a client to an agent;
    /// `rewrite_session_id` is set only for the `session/new` bootstrap
    /// request, where the reply's `sessionId` is replaced with the
    /// relay's own session id rather than the agent's raw one.
    ClientRequest {
        outbound: mpsc::Sender<Value>,
        original_id: Value,
        rewrite_session_id: Option<String>,
    },
    /// A single-shot correlation entry used by the Resume Coordinator
    /// (§4.G), fulfilled by whichever subscriber task first observes a
    /// matching response or error.
    OneShot(oneshot::Sender<Value>),
    /// An agent-originated request (e.g. `session/request_permission`)
    /// awaiting the client's reply, to be forwarded back to this session
    /// verbatim with its id preserved.
    AgentRequest { session_id: String },
}

/// Process-wide table of outstanding correlations, keyed by a string
/// form of the relay-side id (§3, §9 "Global monotonic counter").
pub struct PendingRequests {
    next_id: AtomicU64,
    entries: DashMap<String, PendingEntry>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
        }
    }

    pub fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, key: String, entry: PendingEntry) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&self, key: &str) -> Option<PendingEntry> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drains every outstanding entry, failing `ClientRequest` entries with
    /// a `shutdown` JSON-RPC error and dropping `OneShot`/`AgentRequest`
    /// entries (their awaiters observe a closed channel) (§5 "process
    /// shutdown: ... pending requests fail with `shutdown`").
    pub async fn fail_all(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some(PendingEntry::ClientRequest { outbound, original_id, .. }) = self.remove(&key) {
                let frame = json!({
                    "jsonrpc": "2.0",
                    "id": original_id,
                    "error": crate::rpc::error_object(
                        crate::error::RelayError::Shutdown.json_rpc_code(),
                        crate::error::RelayError::Shutdown.to_string(),
                    ),
                });
                let _ = outbound.send(frame).await;
            }
        }
    }
}

/// Dispatches frames between WebSocket clients and per-session agent
/// adapters.
pub struct Router {
    registry: Arc<SessionRegistry>,
    pending: Arc<PendingRequests>,
}

impl Router {
    pub fn new(registry: Arc<SessionRegistry>, pending: Arc<PendingRequests>) -> Self {
        Self { registry, pending }
    }

    pub fn pending(&self) -> Arc<PendingRequests> {
        Arc::clone(&self.pending)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Serve one client connection end to end: reader loop parses
    /// incoming text frames and dispatches them; writer loop drains the
    /// per-connection outbound queue to the socket. Returns once the
    /// connection closes.
    pub async fn serve<S>(&self, ws: WebSocketStream<S>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(QUEUE_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let Ok(text) = serde_json::to_string(&frame) else {
                    continue;
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut subscribed_sessions: HashSet<String> = HashSet::new();
        while let Some(msg) = stream.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(err) => {
                    tracing::debug!(error = %err, "client websocket read error");
                    break;
                }
            };
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            let frame: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(error = %err, "malformed client frame");
                    continue;
                }
            };
            self.handle_inbound(frame, &outbound_tx, &mut subscribed_sessions)
                .await;
        }

        writer.abort();
    }

    async fn handle_inbound(
        &self,
        frame: Value,
        outbound: &mpsc::Sender<Value>,
        subscribed_sessions: &mut HashSet<String>,
    ) {
        match rpc::classify(&frame) {
            FrameKind::Request => self.handle_request(frame, outbound, subscribed_sessions).await,
            FrameKind::Response => self.handle_client_response(frame).await,
            FrameKind::Notification => self.handle_client_notification(frame).await,
            FrameKind::Malformed => {
                tracing::warn!(frame = %frame, "malformed frame (neither request, response, nor notification)");
            }
        }
    }

    async fn handle_request(
        &self,
        frame: Value,
        outbound: &mpsc::Sender<Value>,
        subscribed_sessions: &mut HashSet<String>,
    ) {
        let client_id = frame["id"].clone();
        let method = frame["method"].as_str().unwrap_or_default().to_string();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);

        match method.as_str() {
            "session/new" => {
                self.handle_session_new(client_id, params, outbound, subscribed_sessions)
                    .await
            }
            "session/resume" => {
                crate::resume::handle_resume(self, client_id, params, outbound.clone(), subscribed_sessions).await
            }
            _ => {
                let Some(session_id) = params.get("sessionId").and_then(Value::as_str).map(str::to_string)
                else {
                    self.reply_error(outbound, client_id, ERROR_BAD_PARAMS, "missing sessionId").await;
                    return;
                };
                self.ensure_subscribed(&session_id, outbound.clone(), subscribed_sessions);
                match rpc::parse_client_request(&method, params.clone()) {
                    ClientRequestMethod::Unhandled { method, .. } if !method.starts_with("session/") => {
                        self.reply_error(outbound, client_id, ERROR_UNKNOWN_METHOD, format!("unknown method {method}"))
                            .await;
                    }
                    _ => {
                        self.forward_request(&session_id, &method, client_id, params, outbound)
                            .await;
                    }
                }
            }
        }
    }

    async fn handle_session_new(
        &self,
        client_id: Value,
        params: Value,
        outbound: &mpsc::Sender<Value>,
        subscribed_sessions: &mut HashSet<String>,
    ) {
        let Some(working_directory) = params.get("workingDirectory").and_then(Value::as_str) else {
            self.reply_error(outbound, client_id, ERROR_BAD_PARAMS, "missing workingDirectory")
                .await;
            return;
        };

        match self.registry.create(working_directory.to_string()).await {
            Ok(session_id) => {
                self.ensure_subscribed(&session_id, outbound.clone(), subscribed_sessions);
                self.forward_request_with_rewrite(
                    &session_id,
                    "session/new",
                    client_id,
                    params,
                    outbound,
                    Some(session_id.clone()),
                )
                .await;
            }
            Err(err) => {
                self.reply_error(outbound, client_id, ERROR_SESSION, err.to_string()).await;
            }
        }
    }

    async fn forward_request(
        &self,
        session_id: &str,
        method: &str,
        client_id: Value,
        params: Value,
        outbound: &mpsc::Sender<Value>,
    ) {
        self.forward_request_with_rewrite(session_id, method, client_id, params, outbound, None)
            .await;
    }

    async fn forward_request_with_rewrite(
        &self,
        session_id: &str,
        method: &str,
        client_id: Value,
        params: Value,
        outbound: &mpsc::Sender<Value>,
        rewrite_session_id: Option<String>,
    ) {
        let relay_id = self.pending.alloc_id();
        self.pending.insert(
            relay_id.to_string(),
            PendingEntry::ClientRequest {
                outbound: outbound.clone(),
                original_id: client_id.clone(),
                rewrite_session_id,
            },
        );

        let frame = json!({"jsonrpc": "2.0", "method": method, "id": relay_id, "params": params});
        if let Err(err) = self.registry.send_to_session(session_id, frame).await {
            self.pending.remove(&relay_id.to_string());
            self.reply_error(outbound, client_id, ERROR_SESSION, err.to_string()).await;
        }
    }

    async fn handle_client_response(&self, frame: Value) {
        let Some(id) = frame.get("id") else { return };
        let key = id.to_string();
        match self.pending.remove(&key) {
            Some(PendingEntry::AgentRequest { session_id }) => {
                if let Err(err) = self.registry.send_to_session(&session_id, frame).await {
                    tracing::warn!(session_id = %session_id, error = %err, "could not deliver client response to agent");
                }
            }
            Some(other) => {
                // Not a reply to an agent-originated request; put it back
                // so the rightful owner (a session forwarder task) can
                // still claim it.
                self.pending.insert(key, other);
            }
            None => {
                tracing::debug!(id = %id, "response with no matching pending request");
            }
        }
    }

    async fn handle_client_notification(&self, frame: Value) {
        let Some(session_id) = frame
            .get("params")
            .and_then(|p| p.get("sessionId"))
            .and_then(Value::as_str)
        else {
            tracing::warn!(frame = %frame, "client notification missing params.sessionId");
            return;
        };
        if let Err(err) = self.registry.send_to_session(session_id, frame.clone()).await {
            tracing::debug!(session_id = %session_id, error = %err, "dropping client notification");
        }
    }

    async fn reply_error(&self, outbound: &mpsc::Sender<Value>, id: Value, code: i32, message: impl Into<String>) {
        let frame = json!({"jsonrpc": "2.0", "id": id, "error": rpc::error_object(code, message)});
        let _ = outbound.send(frame).await;
    }

    /// Subscribes `outbound` to `session_id`'s notification stream if it
    /// isn't already, spawning the per-(connection, session) forwarder
    /// task described in §4.E.
    pub(crate) fn ensure_subscribed(
        &self,
        session_id: &str,
        outbound: mpsc::Sender<Value>,
        subscribed_sessions: &mut HashSet<String>,
    ) {
        if !subscribed_sessions.insert(session_id.to_string()) {
            return;
        }
        let Ok(mut rx) = self.registry.subscribe(session_id) else {
            subscribed_sessions.remove(session_id);
            return;
        };
        let pending = Arc::clone(&self.pending);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            loop {
                let frame = match rx.recv().await {
                    Ok(frame) => frame,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(session_id = %session_id, skipped, "subscriber lagged; notifications dropped");
                        continue;
                    }
                };
                route_session_frame(&pending, &session_id, frame, &outbound).await;
            }
        });
    }
}

/// Classifies one raw frame emitted by a session's agent and routes it:
/// a `Response` is delivered to whichever client owns the matching
/// `ClientRequest`/`OneShot` entry; a `Notification` fans straight out
/// to every subscriber (the broadcast channel already provides the
/// fan-out, so each subscriber task just forwards its own copy); a
/// `Request` (agent-originated, e.g. permission) is recorded so the
/// eventual client reply routes back correctly, then forwarded.
async fn route_session_frame(
    pending: &PendingRequests,
    session_id: &str,
    frame: Value,
    outbound: &mpsc::Sender<Value>,
) {
    match rpc::classify(&frame) {
        FrameKind::Response => {
            let Some(id) = frame.get("id") else { return };
            let key = id.to_string();
            match pending.remove(&key) {
                Some(PendingEntry::ClientRequest {
                    outbound: owner,
                    original_id,
                    rewrite_session_id,
                }) => {
                    let mut reply = frame;
                    reply["id"] = original_id;
                    if let Some(session_id) = rewrite_session_id {
                        if let Some(result) = reply.get_mut("result") {
                            if result.get("sessionId").is_some() {
                                result["sessionId"] = Value::String(session_id);
                            }
                        }
                    }
                    let _ = owner.send(reply).await;
                }
                Some(PendingEntry::OneShot(tx)) => {
                    let _ = tx.send(frame);
                }
                Some(other) => {
                    pending.insert(key, other);
                }
                None => {}
            }
        }
        FrameKind::Notification => {
            let _ = outbound.send(frame).await;
        }
        FrameKind::Request => {
            if let Some(id) = frame.get("id") {
                pending.insert(
                    id.to_string(),
                    PendingEntry::AgentRequest {
                        session_id: session_id.to_string(),
                    },
                );
            }
            let _ = outbound.send(frame).await;
        }
        FrameKind::Malformed => {
            tracing::warn!(session_id = %session_id, "malformed frame from agent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_requests_allocates_monotonic_ids() {
        let pending = PendingRequests::new();
        let a = pending.alloc_id();
        let b = pending.alloc_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn client_request_entry_round_trips_through_route_session_frame() {
        let pending = PendingRequests::new();
        let (tx, mut rx) = mpsc::channel(4);
        pending.insert(
            "7".to_string(),
            PendingEntry::ClientRequest {
                outbound: tx.clone(),
                original_id: json!(1),
                rewrite_session_id: None,
            },
        );
        route_session_frame(&pending, "s1", json!({"id": 7, "result": {"ok": true}}), &tx).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply["id"], json!(1));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn session_new_result_is_rewritten_to_relay_session_id() {
        let pending = PendingRequests::new();
        let (tx, mut rx) = mpsc::channel(4);
        pending.insert(
            "9".to_string(),
            PendingEntry::ClientRequest {
                outbound: tx.clone(),
                original_id: json!(1),
                rewrite_session_id: Some("relay-session-id".to_string()),
            },
        );
        route_session_frame(
            &pending,
            "relay-session-id",
            json!({"id": 9, "result": {"sessionId": "agent-assigned"}}),
            &tx,
        )
        .await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply["result"]["sessionId"], json!("relay-session-id"));
    }

    #[tokio::test]
    async fn agent_request_is_recorded_and_forwarded() {
        let pending = PendingRequests::new();
        let (tx, mut rx) = mpsc::channel(4);
        route_session_frame(
            &pending,
            "s1",
            json!({"method": "session/request_permission", "id": 42, "params": {}}),
            &tx,
        )
        .await;
        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded["id"], json!(42));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn fail_all_replies_shutdown_error_to_pending_client_requests() {
        let pending = PendingRequests::new();
        let (tx, mut rx) = mpsc::channel(4);
        pending.insert(
            "1".to_string(),
            PendingEntry::ClientRequest {
                outbound: tx,
                original_id: json!(1),
                rewrite_session_id: None,
            },
        );
        pending.fail_all().await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply["error"]["message"], json!("shutdown"));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn notification_fans_straight_through() {
        let pending = PendingRequests::new();
        let (tx, mut rx) = mpsc::channel(4);
        route_session_frame(
            &pending,
            "s1",
            json!({"method": "session/chunk", "params": {"sessionId": "s1", "content": "hi"}}),
            &tx,
        )
        .await;
        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded["params"]["content"], "hi");
    }
}
