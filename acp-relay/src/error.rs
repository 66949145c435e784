//! Error types for the relay.

use thiserror::Error;

/// Top-level error type returned by relay operations.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sandbox engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already closed: {0}")]
    SessionAlreadyClosed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("shutdown")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// The JSON-RPC error code this error should be reported to clients as
    /// (see SPEC_FULL.md §7).
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            RelayError::SessionNotFound(_) | RelayError::SessionAlreadyClosed(_) => -32000,
            RelayError::Protocol(_) => -32602,
            _ => -32603,
        }
    }

    /// Render as the `{code, message}` object the wire format expects.
    pub fn to_json_rpc_error(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.json_rpc_code(),
            "message": self.to_string(),
        })
    }
}
