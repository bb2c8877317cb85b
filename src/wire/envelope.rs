//! Wire envelopes: inbound instruction parsing and outbound line shapes.
//!
//! # Inbound methods
//!
//! | `type`          | Maps to                     |
//! |-----------------|-----------------------------|
//! | `agent_request` | [`Inbound::AgentRequest`]   |
//! | `shutdown`      | [`Inbound::Shutdown`]       |
//! | `ping`          | [`Inbound::Ping`]           |
//! | `cancel`        | [`Inbound::Cancel`]         |
//! | *(any other)*   | Parse error → one `error` line, worker keeps running |
//!
//! Outbound lines are built as [`serde_json::Value`]s and serialised by the
//! writer task. Forwarded engine messages stay opaque; [`tagged`] only
//! injects the `request_id` attribution field.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::engine::EngineMessage;
use crate::{AppError, Result};

// ── Inbound ───────────────────────────────────────────────────────────────────

/// One parsed instruction from the host.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Run (or continue) an engine call.
    AgentRequest {
        /// Correlation id, unique per request.
        request_id: String,
        /// Engine configuration and prompt content.
        config: EngineConfig,
    },
    /// Stop accepting work, drain in-flight executions, and exit.
    Shutdown,
    /// Liveness probe; answered with a `pong` line and nothing else.
    Ping,
    /// Cancel the currently active execution if the id matches.
    Cancel {
        /// Id of the request to cancel.
        request_id: String,
    },
}

/// One logical unit of work: a correlation id plus its engine configuration.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    /// Correlation id every output line of this request is tagged with.
    pub request_id: String,
    /// Engine configuration and prompt content.
    pub config: EngineConfig,
}

/// Parse a single protocol line from the host.
///
/// Returns `Ok(None)` for an empty or whitespace-only line, which is
/// silently skipped.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] for malformed JSON, an unrecognised
/// `type`, or a missing required field. The caller answers with one `error`
/// line and keeps reading; one bad line never takes down the worker.
pub fn parse_inbound(line: &str) -> Result<Option<Inbound>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| AppError::Protocol(format!("malformed request: {e}")))
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Readiness line emitted once at startup, before any request is accepted.
#[must_use]
pub fn sidecar_ready() -> Value {
    json!({"type": "sidecar_ready"})
}

/// Reply to a `ping`.
#[must_use]
pub fn pong() -> Value {
    json!({"type": "pong"})
}

/// Structured reply to a malformed or unrecognised input line.
///
/// Carries no request id: the line never parsed far enough to have one.
#[must_use]
pub fn protocol_error(message: &str) -> Value {
    json!({"type": "error", "message": message})
}

/// Per-request error line, tagged with the failing request's id.
#[must_use]
pub fn request_error(request_id: &str, message: &str) -> Value {
    json!({"request_id": request_id, "type": "error", "message": message})
}

/// Terminal completion marker, emitted exactly once per `agent_request`
/// regardless of outcome.
#[must_use]
pub fn request_complete(request_id: &str) -> Value {
    json!({"request_id": request_id, "type": "request_complete"})
}

/// Synthetic lifecycle marker (`init_start`, `ready`) bracketing the engine
/// call so the host can distinguish "initializing" from "turn in progress".
#[must_use]
pub fn lifecycle(request_id: &str, kind: &str) -> Value {
    json!({"request_id": request_id, "type": kind})
}

/// Synthetic turn-completion event for a streaming session.
///
/// Tells the host it is safe to push the next turn without it being
/// silently queued mid-turn.
#[must_use]
pub fn turn_complete(request_id: &str) -> Value {
    json!({"request_id": request_id, "type": "turn_complete"})
}

/// Session-exhaustion event: the engine stopped consuming input without an
/// explicit close, so the dispatcher evicts the session.
#[must_use]
pub fn session_exhausted(request_id: &str, session_id: &str) -> Value {
    json!({
        "request_id": request_id,
        "type": "session_exhausted",
        "session_id": session_id,
    })
}

/// Tag a forwarded engine message with the request id it is attributed to.
///
/// Object payloads get a `request_id` field injected in place; any other
/// payload shape is wrapped under a `payload` key so the attribution is
/// never lost.
#[must_use]
pub fn tagged(request_id: &str, message: EngineMessage) -> Value {
    let mut value = message.into_value();
    match value {
        Value::Object(ref mut map) => {
            map.insert("request_id".to_owned(), Value::String(request_id.to_owned()));
            value
        }
        other => json!({"request_id": request_id, "payload": other}),
    }
}
