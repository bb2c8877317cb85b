//! Per-request engine configuration and the global offline test-mode flag.
//!
//! The host delivers an [`EngineConfig`] inside every `agent_request`
//! envelope. All fields are optional at the serde layer so a structurally
//! valid envelope always parses with its `request_id` intact; semantic
//! requirements are enforced by [`EngineConfig::validate`], which turns a
//! missing identity into a per-request error instead of an untagged
//! protocol error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;

use crate::{AppError, Result};

/// Configuration for one conversation-engine invocation.
///
/// Carried verbatim on the wire inside `agent_request` envelopes. The shape
/// mirrors what the engine accepts; the worker itself only inspects the
/// session routing fields (`session_id`, `close_session`), the prompt, and
/// the credential.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Model or agent identity. Required; enforced by [`Self::validate`].
    #[serde(default)]
    pub model: Option<String>,
    /// Prompt content for this request, or the next turn of a session.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Working directory the engine operates in.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Capability allowlist forwarded to the engine.
    #[serde(default)]
    pub allowed_capabilities: Vec<String>,
    /// Maximum number of assistant turns per invocation.
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Resumption token for continuing a prior engine conversation.
    #[serde(default)]
    pub resume: Option<String>,
    /// Engine feature flags, passed through uninterpreted.
    #[serde(default)]
    pub feature_flags: HashMap<String, bool>,
    /// Streaming-session identifier. When present the request is routed to
    /// the multi-turn session bridge instead of the one-shot executor.
    #[serde(default)]
    pub session_id: Option<String>,
    /// When `true`, close the session named by `session_id` instead of
    /// pushing a turn into it.
    #[serde(default)]
    pub close_session: bool,
    /// Credential delegated to the engine via the process environment
    /// immediately before invocation (see `executor::apply_credential`).
    #[serde(default)]
    pub api_key: Option<String>,
}

impl EngineConfig {
    /// Validate the semantic requirements serde cannot express.
    ///
    /// # Errors
    ///
    /// - [`AppError::Config`]`("missing required field: model")` when the
    ///   identity field is absent or empty.
    /// - [`AppError::Config`]`("close_session requires session_id")` when a
    ///   close instruction has no session to act on.
    /// - [`AppError::Config`]`("missing prompt")` when the request carries
    ///   neither prompt content nor a session-close instruction.
    pub fn validate(&self) -> Result<()> {
        match &self.model {
            Some(model) if !model.trim().is_empty() => {}
            _ => {
                return Err(AppError::Config("missing required field: model".into()));
            }
        }

        if self.close_session && self.session_id.is_none() {
            return Err(AppError::Config("close_session requires session_id".into()));
        }

        if self.prompt.is_none() && !self.close_session {
            return Err(AppError::Config("missing prompt".into()));
        }

        Ok(())
    }
}

// ── Offline test mode ─────────────────────────────────────────────────────────

/// Process-wide offline/test-mode flag.
///
/// Set once at bootstrap from `--offline` or `SIDECAR_OFFLINE`; read by the
/// streaming session bridge, which refuses real calls while it is active.
static OFFLINE_MODE: AtomicBool = AtomicBool::new(false);

/// Enable or disable offline test mode for the whole process.
pub fn set_offline_mode(enabled: bool) {
    OFFLINE_MODE.store(enabled, Ordering::SeqCst);
}

/// Whether the worker is running in offline test mode.
#[must_use]
pub fn offline_mode() -> bool {
    OFFLINE_MODE.load(Ordering::SeqCst)
}
