//! Client-visible display records.
//!
//! `Message` is the record the terminal UI renders; the relay core only
//! needs to know its shape and enforce the bounded-FIFO invariant per
//! session (see `MessageStore`). Persistence of these records is optional
//! (see SPEC_FULL.md open question on message history).

use crate::time;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// The kind of a client-visible message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Agent,
    Tool,
    System,
    Error,
    PermissionRequest,
    PermissionResponse,
    AvailableCommands,
    ToolUse,
    Thinking,
    ThoughtChunk,
    Unhandled,
}

/// A single client-visible message belonging to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub session_id: String,
    pub kind: MessageKind,
    pub content: String,
    #[serde(with = "time")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux: Option<Value>,
}

impl Message {
    pub fn new(session_id: impl Into<String>, kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            content: content.into(),
            timestamp: Utc::now(),
            aux: None,
        }
    }

    pub fn with_aux(mut self, aux: Value) -> Self {
        self.aux = Some(aux);
        self
    }
}

/// A bounded FIFO message store, one queue per session.
///
/// Pushing past `limit` silently drops the oldest entry for that session;
/// this is the enforcement point for the `length(messages[session]) <=
/// limit` invariant.
#[derive(Debug)]
pub struct MessageStore {
    limit: usize,
    sessions: Mutex<HashMap<String, VecDeque<Message>>>,
}

impl MessageStore {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Append a message, evicting the oldest entry for the session if full.
    pub fn push(&self, message: Message) {
        let mut sessions = self.sessions.lock().unwrap();
        let queue = sessions.entry(message.session_id.clone()).or_default();
        if queue.len() >= self.limit {
            queue.pop_front();
        }
        queue.push_back(message);
    }

    /// Snapshot all messages currently stored for a session, oldest first.
    pub fn get(&self, session_id: &str) -> Vec<Message> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all messages for a session (called on session close).
    pub fn clear(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    pub fn len(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_evicts_oldest_past_limit() {
        let store = MessageStore::new(3);
        for i in 0..5 {
            store.push(Message::new("s1", MessageKind::Agent, format!("msg-{i}")));
        }
        let messages = store.get("s1");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "msg-2");
        assert_eq!(messages[2].content, "msg-4");
    }

    #[test]
    fn sessions_are_isolated() {
        let store = MessageStore::new(10);
        store.push(Message::new("a", MessageKind::User, "hi"));
        store.push(Message::new("b", MessageKind::User, "hello"));
        assert_eq!(store.len("a"), 1);
        assert_eq!(store.len("b"), 1);
        store.clear("a");
        assert_eq!(store.len("a"), 0);
        assert_eq!(store.len("b"), 1);
    }
}
