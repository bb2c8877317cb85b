//! Outbound writer task.
//!
//! Receives outbound JSON lines from a tokio [`mpsc`] channel, serialises
//! each value to a compact single-line string, and writes the NDJSON line to
//! the host-facing output stream (stdout in production). Diagnostic output
//! never travels through this channel; it goes to stderr via `tracing`, so
//! protocol lines are never interleaved with logs.
//!
//! The task exits when the channel closes, i.e. when every producer (the
//! dispatcher and all execution tasks) has finished. There is deliberately
//! no cancellation path: terminal `request_complete` markers queued during
//! shutdown must still reach the host.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Writer task — serialises outbound JSON values and writes NDJSON lines.
///
/// # Errors
///
/// - [`AppError::Protocol`]`("failed to serialise outbound line: …")` if
///   [`serde_json::to_vec`] fails (should not occur for `Value`).
/// - [`AppError::Io`] if the write fails (e.g. the host closed the pipe).
pub async fn run_writer<W>(mut out: W, mut line_rx: mpsc::Receiver<serde_json::Value>) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(value) = line_rx.recv().await {
        let mut bytes = serde_json::to_vec(&value).map_err(|e| {
            AppError::Protocol(format!("failed to serialise outbound line: {e}"))
        })?;

        // NDJSON: append the newline delimiter.
        bytes.push(b'\n');

        out.write_all(&bytes).await.map_err(|e| {
            warn!(error = %e, "writer: output stream write failed");
            AppError::Io(e.to_string())
        })?;
        out.flush().await.map_err(|e| AppError::Io(e.to_string()))?;
    }

    debug!("writer: line channel closed, stopping");
    Ok(())
}
