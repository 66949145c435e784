//! Agent Adapter: presents a `SandboxHandle` as a duplex JSON-RPC endpoint
//! (SPEC_FULL.md §4.C).
//!
//! Ground: the newline-delimited JSON read/write loop is modeled on
//! `ahma_http_bridge::session::SessionManager::handle_session_io`'s
//! `tokio::select!` over an `mpsc::Receiver<String>` (outbound) and a
//! `BufReader::lines()` (inbound), generalized from one fixed subprocess
//! to an injected `SandboxHandle`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::error::{RelayError, Result};
use crate::sandbox::SandboxHandle;

/// Frames above this size are a protocol error (§4.C).
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A duplex JSON-RPC endpoint backed by a sandbox's demultiplexed stdio.
pub struct AgentAdapter {
    handle: Arc<SandboxHandle>,
    inbound: mpsc::Receiver<Result<Value>>,
    reader_task: tokio::task::JoinHandle<()>,
    stderr_task: tokio::task::JoinHandle<()>,
}

impl AgentAdapter {
    /// Attach to a freshly created or reused sandbox. Takes ownership of
    /// its demultiplexed stdout/stderr readers; must be called at most
    /// once per handle.
    pub async fn attach(handle: Arc<SandboxHandle>) -> Result<Self> {
        let stdout = handle
            .take_stdout()
            .await
            .ok_or_else(|| RelayError::Protocol("stdout already taken for sandbox".into()))?;
        let stderr = handle
            .take_stderr()
            .await
            .ok_or_else(|| RelayError::Protocol("stderr already taken for sandbox".into()))?;

        let (tx, rx) = mpsc::channel(1024);
        let session_id = handle.session_id.clone();
        let demux_error = handle.demux_error_receiver();
        let reader_task = tokio::spawn(read_frames(stdout, tx, session_id.clone(), demux_error));
        let stderr_task = tokio::spawn(drain_stderr(stderr, session_id));

        Ok(Self {
            handle,
            inbound: rx,
            reader_task,
            stderr_task,
        })
    }

    /// Write one JSON-RPC value to the agent's stdin, newline-terminated.
    /// A single underlying write call is attempted first; if it is short,
    /// the remainder is written under the same lock (§4.C).
    pub async fn send(&self, frame: &Value) -> Result<()> {
        let mut bytes = serde_json::to_vec(frame)?;
        bytes.push(b'\n');
        self.handle.write_stdin(&bytes).await
    }

    /// Receive the next JSON-RPC value produced by the agent. Returns
    /// `Ok(None)` once the agent's stdout is exhausted (clean close).
    pub async fn recv(&mut self) -> Result<Option<Value>> {
        match self.inbound.recv().await {
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// Close stdin (EOF), drain stdout with a bounded timeout, then drop
    /// the sandbox handle (§4.C).
    pub async fn close(mut self) -> Result<()> {
        self.handle.close_stdin().await.ok();
        let _ = tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, async {
            while self.inbound.recv().await.is_some() {}
        })
        .await;
        self.reader_task.abort();
        self.stderr_task.abort();
        Ok(())
    }
}

async fn read_frames<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    tx: mpsc::Sender<Result<Value>>,
    session_id: String,
    mut demux_error: tokio::sync::watch::Receiver<Option<crate::demux::DemuxError>>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match read_bounded_line(&mut lines).await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let parsed = serde_json::from_str::<Value>(&line).map_err(RelayError::from);
                if tx.send(parsed).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                // The duplex pipe closing looks identical whether the
                // demuxer hit a clean EOF or a protocol/IO error; check
                // its side channel before reporting this as clean.
                if let Some(err) = demux_error.borrow_and_update().clone() {
                    tracing::warn!(session_id = %session_id, error = %err, "agent stdout closed after a demux failure");
                    let _ = tx.send(Err(RelayError::Protocol(err.to_string()))).await;
                }
                return;
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "agent adapter protocol error");
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
}

/// Reads one line, enforcing the 10 MiB oversized-frame limit (§4.C).
async fn read_bounded_line(
    lines: &mut tokio::io::Lines<BufReader<impl tokio::io::AsyncRead + Unpin>>,
) -> Result<Option<String>> {
    match lines.next_line().await? {
        Some(line) => {
            if line.len() > MAX_FRAME_BYTES {
                return Err(RelayError::Protocol(format!(
                    "frame of {} bytes exceeds the {} byte limit",
                    line.len(),
                    MAX_FRAME_BYTES
                )));
            }
            Ok(Some(line))
        }
        None => Ok(None),
    }
}

/// Copies stderr bytes to the log sink, prefixed `[sess=<id>]`; never
/// surfaced as JSON (§4.C).
async fn drain_stderr<R: tokio::io::AsyncRead + Unpin>(reader: R, session_id: String) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(session_id = %session_id, "[sess={session_id}] {line}"),
            Ok(None) => return,
            Err(err) => {
                tracing::debug!(session_id = %session_id, error = %err, "stderr drain stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_frames_rejects_oversized_lines() {
        let huge = "x".repeat(MAX_FRAME_BYTES + 1);
        let input = format!("{huge}\n");
        let (tx, mut rx) = mpsc::channel(4);
        let (_error_tx, error_rx) = tokio::sync::watch::channel(None);
        tokio::spawn(read_frames(
            std::io::Cursor::new(input.into_bytes()),
            tx,
            "s1".into(),
            error_rx,
        ));
        let result = rx.recv().await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn read_frames_parses_newline_delimited_json() {
        let input = b"{\"a\":1}\n{\"b\":2}\n".to_vec();
        let (tx, mut rx) = mpsc::channel(4);
        let (_error_tx, error_rx) = tokio::sync::watch::channel(None);
        tokio::spawn(read_frames(std::io::Cursor::new(input), tx, "s1".into(), error_rx));
        let first = rx.recv().await.unwrap().unwrap();
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(first, serde_json::json!({"a": 1}));
        assert_eq!(second, serde_json::json!({"b": 2}));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn read_frames_blank_lines_are_skipped() {
        let input = b"\n{\"a\":1}\n\n".to_vec();
        let (tx, mut rx) = mpsc::channel(4);
        let (_error_tx, error_rx) = tokio::sync::watch::channel(None);
        tokio::spawn(read_frames(std::io::Cursor::new(input), tx, "s1".into(), error_rx));
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first, serde_json::json!({"a": 1}));
        assert!(rx.recv().await.is_none());
    }
}
