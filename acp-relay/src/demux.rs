//! Stream demultiplexer for the sandbox-stdio framing protocol
//! (SPEC_FULL.md §4.A, §6 "Sandbox-stdio framing").
//!
//! Ground: driven from a spawned task in the same shape as
//! `ahma_http_bridge::session::SessionManager::handle_session_io`'s
//! dedicated I/O task per subprocess — here the task's only job is to
//! split one interleaved byte stream into two.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

const STDOUT_STREAM_ID: u8 = 1;
const STDERR_STREAM_ID: u8 = 2;
const HEADER_LEN: usize = 8;

/// Pipe capacity for each demultiplexed side; bounds the demuxer's memory
/// use and is the sole source of backpressure (SPEC_FULL.md §4.A, §9).
pub const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("unknown stream id {0} in framing header")]
    UnknownStreamId(u8),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Clone for DemuxError {
    fn clone(&self) -> Self {
        match self {
            DemuxError::UnknownStreamId(id) => DemuxError::UnknownStreamId(*id),
            DemuxError::Io(e) => DemuxError::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// The two demultiplexed output readers produced from one framed stream.
pub struct Demuxed {
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    /// `Some(err)` once the pump loop has exited due to a protocol or I/O
    /// error; readers see a plain EOF on the pipes either way, so this is
    /// the only way to tell a clean close from a failure after the fact
    /// (SPEC_FULL.md §4.A).
    pub error: watch::Receiver<Option<DemuxError>>,
}

/// Spawn a task that reads `source` and splits it into stdout/stderr
/// pipes per the 8-byte header framing. Returns the two readable ends;
/// the writable ends are held by the spawned task and dropped (closing
/// the pipes) when the task exits.
///
/// On a protocol error (unrecognized stream id) or a non-EOF read error,
/// both pipes are closed by dropping their writers and the error is
/// recorded on `Demuxed::error` before the task exits; a truncated final
/// header is treated as plain EOF, never a panic (SPEC_FULL.md §4.A).
pub fn spawn<R>(mut source: R) -> Demuxed
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (error_tx, error_rx) = watch::channel(None);

    tokio::spawn(async move {
        let mut stdout_writer = stdout_writer;
        let mut stderr_writer = stderr_writer;
        if let Err(err) = pump(&mut source, &mut stdout_writer, &mut stderr_writer).await {
            tracing::debug!(error = %err, "demuxer stopped");
            let _ = error_tx.send(Some(err));
        }
    });

    Demuxed {
        stdout: stdout_reader,
        stderr: stderr_reader,
        error: error_rx,
    }
}

async fn pump<R>(
    source: &mut R,
    stdout_writer: &mut DuplexStream,
    stderr_writer: &mut DuplexStream,
) -> Result<(), DemuxError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    loop {
        match read_exact_or_eof(source, &mut header).await? {
            None => return Ok(()),
            Some(()) => {}
        }
        let stream_id = header[0];
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let writer = match stream_id {
            STDOUT_STREAM_ID => &mut *stdout_writer,
            STDERR_STREAM_ID => &mut *stderr_writer,
            other => return Err(DemuxError::UnknownStreamId(other)),
        };

        let mut remaining = len;
        let mut buf = vec![0u8; remaining.min(64 * 1024).max(1)];
        while remaining > 0 {
            let take = remaining.min(buf.len());
            source.read_exact(&mut buf[..take]).await?;
            writer.write_all(&buf[..take]).await?;
            remaining -= take;
        }
    }
}

/// Like `read_exact`, but a zero-byte read on the first byte is treated
/// as a clean EOF instead of an error; any partial read before EOF still
/// produces an `UnexpectedEof` error (truncated frame).
async fn read_exact_or_eof<R>(source: &mut R, buf: &mut [u8]) -> io::Result<Option<()>>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated frame header",
            ));
        }
        filled += n;
    }
    Ok(Some(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn frame(stream_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream_id, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn interleaved_frames_are_split_without_reordering() {
        let mut input = Vec::new();
        input.extend(frame(1, b"hello"));
        input.extend(frame(2, b"err"));
        input.extend(frame(1, b"!"));

        let demuxed = spawn(std::io::Cursor::new(input));
        let mut stdout = demuxed.stdout;
        let mut stderr = demuxed.stderr;

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        stdout.read_to_end(&mut stdout_buf).await.unwrap();
        stderr.read_to_end(&mut stderr_buf).await.unwrap();

        assert_eq!(stdout_buf, b"hello!");
        assert_eq!(stderr_buf, b"err");
    }

    #[tokio::test]
    async fn unknown_stream_id_closes_both_pipes() {
        let input = frame(9, b"bogus");
        let demuxed = spawn(std::io::Cursor::new(input));
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut stdout = demuxed.stdout;
        let mut stderr = demuxed.stderr;
        stdout.read_to_end(&mut stdout_buf).await.unwrap();
        stderr.read_to_end(&mut stderr_buf).await.unwrap();
        assert!(stdout_buf.is_empty());
        assert!(stderr_buf.is_empty());
    }

    #[tokio::test]
    async fn truncated_final_header_yields_eof_not_panic() {
        let mut input = frame(1, b"complete");
        input.extend_from_slice(&[1, 0, 0]); // partial next header
        let demuxed = spawn(std::io::Cursor::new(input));
        let mut stdout_buf = Vec::new();
        let mut stdout = demuxed.stdout;
        stdout.read_to_end(&mut stdout_buf).await.unwrap();
        assert_eq!(stdout_buf, b"complete");
    }

    #[tokio::test]
    async fn payload_split_across_many_small_reads_is_tolerated() {
        struct Trickle(std::collections::VecDeque<u8>);
        impl AsyncRead for Trickle {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                if let Some(b) = self.0.pop_front() {
                    buf.put_slice(&[b]);
                }
                std::task::Poll::Ready(Ok(()))
            }
        }

        let bytes = frame(1, b"chunked-payload");
        let demuxed = spawn(Trickle(bytes.into_iter().collect()));
        let mut stdout_buf = Vec::new();
        let mut stdout = demuxed.stdout;
        stdout.read_to_end(&mut stdout_buf).await.unwrap();
        assert_eq!(stdout_buf, b"chunked-payload");
    }
}
