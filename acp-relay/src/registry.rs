//! Session Registry (SPEC_FULL.md §4.D).
//!
//! Ground: the in-memory map is a `dashmap::DashMap`, the same primitive
//! `ahma_http_bridge::session::SessionManager::sessions` uses to give
//! overlapping reads and per-key serialized writes without a manual
//! reader/writer lock. The persisted shadow lives in [`crate::storage`].
//!
//! Each session gets one pump task shaped like
//! `SessionManager::handle_session_io`: a `tokio::select!` over an
//! outbound `mpsc::Receiver<Value>` (frames to write to the agent) and
//! the adapter's `recv()` (frames read from the agent), republishing
//! everything it reads onto a `broadcast::Sender<Value>` that the Router
//! (§4.E) classifies and fans out.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use acp_relay_common::{Message, MessageStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use crate::adapter::AgentAdapter;
use crate::error::{RelayError, Result};
use crate::rpc;
use crate::sandbox::SandboxManager;
use crate::storage::Storage;

const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;
const OUTBOUND_CHANNEL_CAPACITY: usize = 1024;
const LIFECYCLE_CHANNEL_CAPACITY: usize = 256;

/// A session lifecycle event published for the Management API's live feed
/// (§6.1).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Created(SessionView),
    Closed(SessionView),
}

/// In-memory session record: metadata plus the channels wired to its
/// pump task when active.
pub struct Session {
    pub id: String,
    pub agent_session_id: Option<String>,
    pub working_directory: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub outbound: Option<mpsc::Sender<Value>>,
    pub inbound: Option<broadcast::Sender<Value>>,
    /// Set by the pump task the moment it observes an agent-emitted
    /// `session/complete` notification, so `close()` knows whether it still
    /// needs to synthesize one (§5: "Subscribers receive a `session/complete`
    /// notification if the adapter had not already emitted one").
    complete_emitted: Arc<AtomicBool>,
    pump_task: Option<tokio::task::JoinHandle<()>>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.closed_at.is_none() && self.outbound.is_some()
    }

    /// Subscribe to this session's raw inbound frames (responses,
    /// notifications, and agent-originated requests alike); the Router
    /// and Resume Coordinator classify what they receive.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<Value>> {
        self.inbound
            .as_ref()
            .map(|tx| tx.subscribe())
            .ok_or_else(|| RelayError::SessionAlreadyClosed(self.id.clone()))
    }

    pub async fn send(&self, frame: Value) -> Result<()> {
        match &self.outbound {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| RelayError::SessionAlreadyClosed(self.id.clone())),
            None => Err(RelayError::SessionAlreadyClosed(self.id.clone())),
        }
    }
}

/// The JSON-facing view returned by the Management API (§4.F, §6).
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: String,
    #[serde(rename = "agentSessionId", skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    #[serde(rename = "workingDirectory")]
    pub working_directory: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "closedAt", skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<String>,
    #[serde(rename = "isActive")]
    pub is_active: bool,
    #[serde(skip)]
    created_at_raw: DateTime<Utc>,
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

impl From<&Session> for SessionView {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            agent_session_id: s.agent_session_id.clone(),
            working_directory: s.working_directory.clone(),
            created_at: s.created_at.format(TIMESTAMP_FORMAT).to_string(),
            closed_at: s.closed_at.map(|t| t.format(TIMESTAMP_FORMAT).to_string()),
            is_active: s.is_active(),
            created_at_raw: s.created_at,
        }
    }
}

/// Owns every active session's state: the in-memory `DashMap`, the
/// persisted shadow, and the sandbox manager used to create/stop them.
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    storage: Arc<Storage>,
    sandboxes: Arc<SandboxManager>,
    messages: Arc<MessageStore>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl SessionRegistry {
    pub fn new(storage: Arc<Storage>, sandboxes: Arc<SandboxManager>, message_history_limit: usize) -> Self {
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self {
            sessions: DashMap::new(),
            storage,
            sandboxes,
            messages: Arc::new(MessageStore::new(message_history_limit)),
            lifecycle,
        }
    }

    /// Subscribe to session-created/session-closed events, for the
    /// Management API's SSE feed (§6.1).
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Client-visible message history recorded for `id`, oldest first
    /// (§3 "Message", §8 bounded-FIFO invariant).
    pub fn messages(&self, id: &str) -> Vec<Message> {
        self.messages.get(id)
    }

    /// On process restart: every row with `closed_at IS NULL` is closed
    /// with `closed_at = startup_time` before the relay accepts traffic
    /// (§4.D, §7) — in-memory sandboxes from a previous process are
    /// assumed gone.
    pub async fn reconcile_on_startup(&self) -> Result<usize> {
        let storage = Arc::clone(&self.storage);
        let now = Utc::now();
        tokio::task::spawn_blocking(move || storage.close_all_open_sessions(now))
            .await
            .map_err(|e| RelayError::Config(format!("startup reconciliation task panicked: {e}")))?
    }

    /// Create a new session: generate an id, create the sandbox, attach
    /// the adapter, persist the row, spawn the pump task. On sandbox or
    /// persistence failure the row is never left behind (no orphan) and
    /// the error is returned (§4.D).
    pub async fn create(&self, working_directory: String) -> Result<String> {
        let id = generate_session_id();
        let handle = self
            .sandboxes
            .create(&id, Path::new(&working_directory))
            .await?;
        let adapter = match AgentAdapter::attach(Arc::clone(&handle)).await {
            Ok(a) => a,
            Err(e) => {
                self.sandboxes.stop(&handle).await.ok();
                return Err(e);
            }
        };

        let created_at = Utc::now();
        let storage = Arc::clone(&self.storage);
        let wd = working_directory.clone();
        let id_for_db = id.clone();
        let write_result = tokio::task::spawn_blocking(move || {
            storage.insert_session(&id_for_db, None, &wd, created_at)
        })
        .await
        .map_err(|e| RelayError::Config(format!("registry write task panicked: {e}")))?;

        if let Err(err) = write_result {
            self.sandboxes.stop(&handle).await.ok();
            return Err(err);
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (inbound_tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let complete_emitted = Arc::new(AtomicBool::new(false));
        let pump_task = spawn_pump(
            id.clone(),
            adapter,
            outbound_rx,
            inbound_tx.clone(),
            Arc::clone(&self.messages),
            Arc::clone(&complete_emitted),
        );

        self.sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                agent_session_id: None,
                working_directory,
                created_at,
                closed_at: None,
                outbound: Some(outbound_tx),
                inbound: Some(inbound_tx),
                complete_emitted,
                pump_task: Some(pump_task),
            },
        );

        if let Some(view) = self.get_view(&id) {
            let _ = self.lifecycle.send(LifecycleEvent::Created(view));
        }

        Ok(id)
    }

    pub fn record_agent_session_id(&self, id: &str, agent_session_id: String) {
        if let Some(mut s) = self.sessions.get_mut(id) {
            s.agent_session_id = Some(agent_session_id);
        }
    }

    pub fn get_view(&self, id: &str) -> Option<SessionView> {
        self.sessions.get(id).map(|s| SessionView::from(&*s))
    }

    pub fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<Value>> {
        self.sessions
            .get(id)
            .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))?
            .subscribe()
    }

    pub async fn send_to_session(&self, id: &str, frame: Value) -> Result<()> {
        let session = self
            .sessions
            .get(id)
            .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))?;
        record_frame(&self.messages, id, &frame);
        session.send(frame).await
    }

    /// Ordered by `created_at` descending; active first when ties on
    /// `created_at` (§4.D).
    pub fn list(&self) -> Vec<SessionView> {
        let mut views: Vec<SessionView> = self.sessions.iter().map(|s| SessionView::from(&*s)).collect();
        views.sort_by(|a, b| b.created_at_raw.cmp(&a.created_at_raw).then(b.is_active.cmp(&a.is_active)));
        views
    }

    /// Idempotent: sets `closed_at`, triggers sandbox stop, removes the
    /// in-memory entry. Unknown id is a "not found" error with no side
    /// effects (§4.D).
    pub async fn close(&self, id: &str) -> Result<()> {
        let Some((_, mut session)) = self.sessions.remove(id) else {
            return Err(RelayError::SessionNotFound(id.to_string()));
        };

        if !session.complete_emitted.swap(true, Ordering::SeqCst) {
            if let Some(inbound) = &session.inbound {
                let _ = inbound.send(session_complete_notification("relay_closed"));
            }
        }

        drop(session.outbound.take());
        if let Some(task) = session.pump_task.take() {
            task.abort();
        }

        let storage = Arc::clone(&self.storage);
        let closed_at = Utc::now();
        let id_owned = id.to_string();
        tokio::task::spawn_blocking(move || storage.close_session(&id_owned, closed_at))
            .await
            .map_err(|e| RelayError::Config(format!("registry close task panicked: {e}")))??;

        session.closed_at = Some(closed_at);
        let _ = self.lifecycle.send(LifecycleEvent::Closed(SessionView::from(&session)));
        self.messages.clear(id);
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_active()).count()
    }

    /// Every active session's id, a snapshot taken under the map's normal
    /// per-shard locking (§4.D).
    pub fn active_session_ids(&self) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.id.clone())
            .collect()
    }

    /// Process shutdown: stop every active session with the configured
    /// grace period (§5 "process shutdown"). Errors for individual
    /// sessions are logged, not propagated — shutdown proceeds regardless.
    pub async fn stop_all(&self) {
        for id in self.active_session_ids() {
            if let Err(err) = self.close(&id).await {
                tracing::warn!(session_id = %id, error = %err, "error stopping session during shutdown");
            }
        }
    }
}

/// Builds a `session/complete` notification the relay synthesizes on a
/// subscriber's behalf, tagged with `reason` so `classify_message` can
/// distinguish it from one the agent emitted itself (§5).
fn session_complete_notification(reason: &str) -> Value {
    json!({"jsonrpc": "2.0", "method": "session/complete", "params": {"reason": reason}})
}

/// Records one client-visible message derived from a raw frame, if it
/// classifies to a displayable kind (see [`rpc::classify_message`]).
fn record_frame(store: &MessageStore, session_id: &str, frame: &Value) {
    if let Some((kind, content, aux)) = rpc::classify_message(frame) {
        let mut message = Message::new(session_id, kind, content);
        if let Some(aux) = aux {
            message = message.with_aux(aux);
        }
        store.push(message);
    }
}

/// The per-session pump task: writes outbound frames to the adapter and
/// republishes everything the adapter produces onto the broadcast
/// channel, until the adapter closes or the outbound channel is dropped.
fn spawn_pump(
    session_id: String,
    mut adapter: AgentAdapter,
    mut outbound_rx: mpsc::Receiver<Value>,
    inbound_tx: broadcast::Sender<Value>,
    messages: Arc<MessageStore>,
    complete_emitted: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(err) = adapter.send(&frame).await {
                                tracing::warn!(session_id = %session_id, error = %err, "failed writing to agent");
                                break;
                            }
                        }
                        None => break,
                    }
                }
                received = adapter.recv() => {
                    match received {
                        Ok(Some(value)) => {
                            if value.get("method").and_then(Value::as_str) == Some("session/complete") {
                                complete_emitted.store(true, Ordering::SeqCst);
                            }
                            record_frame(&messages, &session_id, &value);
                            let _ = inbound_tx.send(value);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            tracing::warn!(session_id = %session_id, error = %err, "agent adapter error");
                            break;
                        }
                    }
                }
            }
        }
        adapter.close().await.ok();
    })
}

/// Generates an opaque, globally-unique session id of at least 16
/// characters (§3).
fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_sufficiently_long_and_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert!(a.len() >= 16);
        assert_ne!(a, b);
    }

    fn test_registry() -> SessionRegistry {
        let storage = Arc::new(crate::storage::Storage::open_in_memory().unwrap());
        let sandboxes = Arc::new(SandboxManager::new(
            Arc::new(crate::sandbox::CliContainerEngine),
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
        SessionRegistry::new(storage, sandboxes, 500)
    }

    fn insert_bare_session(registry: &SessionRegistry, id: &str, complete_emitted: bool) -> broadcast::Receiver<Value> {
        let created_at = Utc::now();
        registry
            .storage
            .insert_session(id, None, "/w", created_at)
            .unwrap();
        let (inbound_tx, inbound_rx) = broadcast::channel(16);
        registry.sessions.insert(
            id.to_string(),
            Session {
                id: id.to_string(),
                agent_session_id: None,
                working_directory: "/w".to_string(),
                created_at,
                closed_at: None,
                outbound: None,
                inbound: Some(inbound_tx),
                complete_emitted: Arc::new(AtomicBool::new(complete_emitted)),
                pump_task: None,
            },
        );
        inbound_rx
    }

    #[test]
    fn session_complete_notification_carries_reason() {
        let frame = session_complete_notification("relay_closed");
        assert_eq!(frame["method"], json!("session/complete"));
        assert_eq!(frame["params"]["reason"], json!("relay_closed"));
    }

    #[tokio::test]
    async fn close_synthesizes_session_complete_when_agent_never_emitted_one() {
        let registry = test_registry();
        let mut inbound_rx = insert_bare_session(&registry, "s1", false);

        registry.close("s1").await.unwrap();

        let frame = inbound_rx.recv().await.unwrap();
        assert_eq!(frame["method"], json!("session/complete"));
        assert_eq!(frame["params"]["reason"], json!("relay_closed"));
    }

    #[tokio::test]
    async fn close_does_not_duplicate_session_complete_already_emitted_by_agent() {
        let registry = test_registry();
        let mut inbound_rx = insert_bare_session(&registry, "s1", true);

        registry.close("s1").await.unwrap();

        assert!(inbound_rx.try_recv().is_err());
    }

    #[test]
    fn session_view_formats_timestamps_without_timezone_suffix() {
        let session = Session {
            id: "abc".into(),
            agent_session_id: None,
            working_directory: "/w".into(),
            created_at: Utc::now(),
            closed_at: None,
            outbound: None,
            inbound: None,
            complete_emitted: Arc::new(AtomicBool::new(false)),
            pump_task: None,
        };
        let view = SessionView::from(&session);
        assert!(!view.created_at.contains('T'));
        assert!(!view.is_active);
    }
}
