//! Conversation engine seam.
//!
//! The engine is an injected, opaque asynchronous completion service: it
//! accepts an [`EngineConfig`] and either a literal prompt or a pull-driven
//! stream of turns, and yields a stream of [`EngineMessage`]s terminated by
//! the engine's result or an error. The worker forwards those messages
//! without interpreting them.
//!
//! Implementations:
//! - `process`: spawns a configurable agent CLI and bridges its stdio.
//! - `offline`: deterministic echo engine for offline test mode.

pub mod offline;
pub mod process;

use std::future::Future;
use std::pin::Pin;

use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::Result;

/// Stream of opaque messages produced by one engine invocation.
pub type EngineStream = BoxStream<'static, Result<EngineMessage>>;

/// Pull-driven stream of input turns for a multi-turn invocation.
pub type TurnStream = BoxStream<'static, String>;

/// Input handed to one engine invocation.
pub enum EngineInput {
    /// A single literal prompt; the engine runs one conversation to its end.
    Prompt(String),
    /// A pull-driven sequence of turns; the engine keeps consuming until
    /// the stream ends.
    Turns(TurnStream),
}

impl std::fmt::Debug for EngineInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prompt(p) => f.debug_tuple("Prompt").field(p).finish(),
            Self::Turns(_) => f.debug_tuple("Turns").field(&"<stream>").finish(),
        }
    }
}

/// Opaque message envelope produced by the engine.
///
/// The worker treats message contents as untyped JSON passed through to the
/// host verbatim. The only fields it peeks at are the `type` tag and the
/// stop condition, which drive synthetic turn-completion events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct EngineMessage(serde_json::Value);

impl EngineMessage {
    /// Wrap a raw JSON value as an engine message.
    #[must_use]
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// The message's `type` tag, if present.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(serde_json::Value::as_str)
    }

    /// The message's stop condition, if present.
    ///
    /// Checked at the top level first, then under a nested `message` object
    /// (the shape some engines use for assistant payloads).
    #[must_use]
    pub fn stop_reason(&self) -> Option<&str> {
        self.0
            .get("stop_reason")
            .or_else(|| self.0.get("message").and_then(|m| m.get("stop_reason")))
            .and_then(serde_json::Value::as_str)
    }

    /// Whether this message ends a turn.
    ///
    /// An assistant message ends its turn unless it stopped to invoke a
    /// capability (`"tool_use"`), in which case more output follows before
    /// the next host turn is safe to push.
    #[must_use]
    pub fn ends_turn(&self) -> bool {
        self.kind() == Some("assistant") && self.stop_reason() != Some("tool_use")
    }

    /// Consume the envelope, yielding the raw JSON value.
    #[must_use]
    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

/// Injected asynchronous completion service.
///
/// `invoke` resolves once the call handle exists (the returned stream is the
/// handle); message production happens as the stream is polled. The `cancel`
/// token is the cooperative cancellation channel: implementations should end
/// the stream promptly when it fires, but the worker survives engines that
/// ignore it (see `abort::arm_hard_exit`).
pub trait ConversationEngine: Send + Sync {
    /// Start one engine invocation.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Engine`](crate::AppError::Engine) when the
    /// invocation cannot be started at all (for example, the engine process
    /// fails to spawn). Failures after startup are reported through the
    /// stream items instead.
    fn invoke(
        &self,
        config: &EngineConfig,
        input: EngineInput,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<EngineStream>> + Send + '_>>;
}
