//! One-shot request execution.
//!
//! Runs a single [`WorkRequest`] to completion against the conversation
//! engine, forwarding every engine message to the outbound channel in
//! emission order and bracketing the call with synthetic lifecycle markers
//! (`init_start` before invocation, `ready` once the call handle exists) so
//! the host UI can distinguish "initializing" from "turn in progress".
//!
//! Engine errors are propagated to the caller uncaught: the executor never
//! converts or swallows them. The dispatcher's execution wrapper owns the
//! error line and the terminal `request_complete` marker.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::abort::AbortState;
use crate::config::EngineConfig;
use crate::engine::{ConversationEngine, EngineInput};
use crate::wire::envelope::{self, WorkRequest};
use crate::{AppError, Result};

/// Environment variable the engine reads its delegated credential from.
pub const CREDENTIAL_ENV_VAR: &str = "ENGINE_API_KEY";

/// Write the request's credential into process-wide environment state.
///
/// This is the only channel for delegating a secret into the engine call:
/// the engine interface has no per-call credential parameter. Mutating
/// process state here is race-free only because the single-flight invariant
/// guarantees at most one engine invocation at a time.
pub fn apply_credential(config: &EngineConfig) {
    if let Some(key) = &config.api_key {
        std::env::set_var(CREDENTIAL_ENV_VAR, key);
    }
}

/// Run one logical request to completion against the engine.
///
/// Message forwarding stops on abort; already-in-flight messages are not
/// recovered. Cancellation is not an error: the loop exits quietly and the
/// caller still emits the completion marker.
///
/// # Errors
///
/// - [`AppError::Config`] when the request configuration is invalid; no
///   engine call is made.
/// - [`AppError::Engine`] propagated verbatim from the engine, either at
///   invocation or mid-stream.
/// - [`AppError::Io`] when the outbound channel has closed underneath the
///   execution.
pub async fn run_request(
    engine: &dyn ConversationEngine,
    request: &WorkRequest,
    abort: &AbortState,
    out_tx: &mpsc::Sender<serde_json::Value>,
) -> Result<()> {
    let request_id = request.request_id.as_str();

    request.config.validate()?;

    send_line(out_tx, envelope::lifecycle(request_id, "init_start")).await?;

    // Delegate the credential immediately before invocation; single-flight
    // keeps this race-free.
    apply_credential(&request.config);

    let prompt = request.config.prompt.clone().unwrap_or_default();
    let mut stream = engine
        .invoke(&request.config, EngineInput::Prompt(prompt), abort.token())
        .await?;

    send_line(out_tx, envelope::lifecycle(request_id, "ready")).await?;

    let cancel = abort.token();
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(request_id, "executor: abort received, stopping forwarding");
                break;
            }

            item = stream.next() => {
                match item {
                    None => {
                        debug!(request_id, "executor: engine stream ended");
                        break;
                    }
                    Some(Ok(message)) => {
                        send_line(out_tx, envelope::tagged(request_id, message)).await?;
                    }
                    // Engine exceptions propagate to the caller uncaught.
                    Some(Err(err)) => return Err(err),
                }
            }
        }
    }

    Ok(())
}

/// Send one outbound line, mapping a closed channel to an I/O error.
async fn send_line(
    out_tx: &mpsc::Sender<serde_json::Value>,
    line: serde_json::Value,
) -> Result<()> {
    out_tx
        .send(line)
        .await
        .map_err(|_| AppError::Io("outbound channel closed".into()))
}
