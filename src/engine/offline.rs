//! Offline test-mode engine.
//!
//! A deterministic stand-in used when the worker runs with `--offline`: it
//! echoes the prompt back as a single assistant message followed by a
//! result, never touching the network or spawning a process. One-shot
//! requests work end to end against it; streaming sessions remain
//! unsupported in offline mode and are rejected by the session bridge
//! before any engine call is made.

use std::pin::Pin;

use futures_util::{stream, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::engine::{ConversationEngine, EngineInput, EngineMessage, EngineStream};
use crate::{AppError, Result};

/// Engine that answers every prompt with a canned echo, for offline runs.
#[derive(Debug, Clone, Default)]
pub struct OfflineEngine;

impl OfflineEngine {
    /// Create an offline engine.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ConversationEngine for OfflineEngine {
    fn invoke(
        &self,
        config: &EngineConfig,
        input: EngineInput,
        _cancel: CancellationToken,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<EngineStream>> + Send + '_>> {
        let model = config.model.clone().unwrap_or_default();

        Box::pin(async move {
            let EngineInput::Prompt(prompt) = input else {
                return Err(AppError::Engine(
                    "offline engine does not support streaming input".into(),
                ));
            };

            let messages = vec![
                Ok(EngineMessage::new(json!({
                    "type": "assistant",
                    "model": model,
                    "stop_reason": "end_turn",
                    "content": format!("[offline] {prompt}"),
                }))),
                Ok(EngineMessage::new(json!({
                    "type": "result",
                    "is_error": false,
                }))),
            ];

            Ok(stream::iter(messages).boxed())
        })
    }
}
