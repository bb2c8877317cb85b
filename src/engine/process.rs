//! Process-backed conversation engine.
//!
//! Spawns a configurable agent CLI once per invocation and bridges its
//! stdio: input turns are written to the child's stdin as NDJSON
//! `{"type":"user","content":…}` lines, and every line the child prints to
//! stdout is decoded as one opaque [`EngineMessage`]. The child's stderr is
//! inherited so its diagnostics land on the worker's error channel, never on
//! the protocol stream.
//!
//! Process hygiene:
//! - `kill_on_drop(true)`, so dropping the output stream terminates the
//!   child.
//! - `env_clear()` plus a safe variable allowlist, so host secrets never
//!   leak into the child beyond the one delegated credential.
//!
//! Cancellation ends the output stream via `take_until`; the caller drops
//! the stream and the child dies with it. There is deliberately no startup
//! or per-request timeout: the host cancels explicitly.

use std::pin::Pin;

use futures_util::{stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::engine::{ConversationEngine, EngineInput, EngineMessage, EngineStream, TurnStream};
use crate::executor::CREDENTIAL_ENV_VAR;
use crate::wire::codec::WireCodec;
use crate::{AppError, Result};

/// Environment variables inherited by the spawned engine process.
///
/// Everything else is stripped via `env_clear()` before the child launches.
/// The delegated credential is listed explicitly: writing it into the
/// worker's environment (see `executor::apply_credential`) is the only
/// channel for passing it through.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    CREDENTIAL_ENV_VAR,
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Conversation engine that shells out to an agent CLI per invocation.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    /// Engine CLI binary (e.g. an agent runner on `PATH`).
    command: String,
    /// Arguments passed before the per-request configuration flags.
    base_args: Vec<String>,
}

impl ProcessEngine {
    /// Create an engine that spawns `command` with `base_args`.
    #[must_use]
    pub fn new(command: String, base_args: Vec<String>) -> Self {
        Self { command, base_args }
    }

    /// Translate the request configuration into CLI flags.
    fn build_args(&self, config: &EngineConfig) -> Vec<String> {
        let mut args = self.base_args.clone();

        if let Some(model) = &config.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        if let Some(max_turns) = config.max_turns {
            args.push("--max-turns".into());
            args.push(max_turns.to_string());
        }
        if let Some(token) = &config.resume {
            args.push("--resume".into());
            args.push(token.clone());
        }
        for capability in &config.allowed_capabilities {
            args.push("--allow".into());
            args.push(capability.clone());
        }
        for (flag, enabled) in &config.feature_flags {
            if *enabled {
                args.push("--feature".into());
                args.push(flag.clone());
            }
        }

        args
    }
}

impl ConversationEngine for ProcessEngine {
    fn invoke(
        &self,
        config: &EngineConfig,
        input: EngineInput,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<EngineStream>> + Send + '_>> {
        let command = self.command.clone();
        let args = self.build_args(config);
        let cwd = config.cwd.clone();

        Box::pin(async move {
            let mut cmd = Command::new(&command);
            cmd.args(&args);

            // Strip inherited environment, then inject only the allowlist.
            cmd.env_clear();
            for &key in ALLOWED_ENV_VARS {
                if let Ok(value) = std::env::var(key) {
                    cmd.env(key, value);
                }
            }

            if let Some(dir) = &cwd {
                cmd.current_dir(dir);
            }

            cmd.stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::inherit())
                .kill_on_drop(true);

            let mut child = cmd
                .spawn()
                .map_err(|err| AppError::Engine(format!("failed to spawn engine: {err}")))?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| AppError::Engine("failed to capture engine stdin".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| AppError::Engine("failed to capture engine stdout".into()))?;

            debug!(command, "engine process spawned");

            let turns: TurnStream = match input {
                EngineInput::Prompt(prompt) => stream::once(async move { prompt }).boxed(),
                EngineInput::Turns(turns) => turns,
            };
            tokio::spawn(write_turns(stdin, turns, cancel.clone()));

            // The child rides along in the unfold state so dropping the
            // output stream kills it via kill_on_drop.
            let framed = FramedRead::new(stdout, WireCodec::new());
            let lines = stream::unfold((framed, child), |(mut framed, child)| async move {
                framed
                    .next()
                    .await
                    .map(|item| (item, (framed, child)))
            });

            let messages = lines
                .map(|item| match item {
                    Ok(line) => serde_json::from_str(&line)
                        .map(EngineMessage::new)
                        .map_err(|e| AppError::Engine(format!("malformed engine output: {e}"))),
                    Err(err) => Err(AppError::Engine(err.to_string())),
                })
                .take_until(cancel.cancelled_owned());

            Ok(messages.boxed())
        })
    }
}

/// Forward input turns to the engine's stdin as NDJSON lines.
///
/// When the turn stream ends (or cancellation fires), `stdin` is dropped;
/// the resulting EOF tells the engine its input is complete.
async fn write_turns(mut stdin: ChildStdin, mut turns: TurnStream, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("engine input: cancellation received, closing stdin");
                break;
            }

            turn = turns.next() => {
                let Some(text) = turn else {
                    debug!("engine input: turn stream ended, closing stdin");
                    break;
                };

                let line = serde_json::json!({"type": "user", "content": text});
                let Ok(mut bytes) = serde_json::to_vec(&line) else {
                    warn!("engine input: failed to serialise turn, closing stdin");
                    break;
                };
                bytes.push(b'\n');

                if let Err(err) = stdin.write_all(&bytes).await {
                    warn!(%err, "engine input: write failed, closing stdin");
                    break;
                }
                if let Err(err) = stdin.flush().await {
                    warn!(%err, "engine input: flush failed, closing stdin");
                    break;
                }
            }
        }
    }
}
