#![forbid(unsafe_code)]

//! `agent-sidecar` — AI completion worker binary.
//!
//! Bootstraps logging, builds the conversation engine, wires the protocol
//! dispatcher to stdin/stdout, and registers process-level shutdown signals.
//! All diagnostics go to stderr; stdout carries protocol lines only.

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_sidecar::abort::{self, HARD_EXIT_GRACE};
use agent_sidecar::config;
use agent_sidecar::dispatcher::Dispatcher;
use agent_sidecar::engine::offline::OfflineEngine;
use agent_sidecar::engine::process::ProcessEngine;
use agent_sidecar::engine::ConversationEngine;
use agent_sidecar::wire::writer;
use agent_sidecar::{AppError, Result};

/// Outbound line channel depth between the dispatcher and the writer task.
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-sidecar", about = "AI completion worker over NDJSON stdio", version, long_about = None)]
struct Cli {
    /// Engine CLI binary spawned once per invocation.
    #[arg(long, default_value = "agent-engine")]
    engine_cmd: String,

    /// Extra argument passed to the engine CLI before per-request flags
    /// (repeatable).
    #[arg(long = "engine-arg")]
    engine_args: Vec<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Offline test mode: canned one-shot replies, streaming sessions
    /// unsupported. Also enabled by the `SIDECAR_OFFLINE` env var.
    #[arg(long)]
    offline: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-sidecar worker bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    config::set_offline_mode(args.offline || std::env::var_os("SIDECAR_OFFLINE").is_some());

    // ── Build the conversation engine ────────────────────
    let engine: Arc<dyn ConversationEngine> = if config::offline_mode() {
        info!("offline mode active, using the canned engine");
        Arc::new(OfflineEngine::new())
    } else {
        Arc::new(ProcessEngine::new(args.engine_cmd, args.engine_args))
    };

    // ── Wire the protocol to stdio ───────────────────────
    let shutdown = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

    let writer_handle = tokio::spawn(writer::run_writer(tokio::io::stdout(), out_rx));

    let dispatcher = Dispatcher::new(engine, out_tx, shutdown.clone());
    let mut dispatch_handle = tokio::spawn(dispatcher.run(tokio::io::stdin()));

    // ── Wait for completion or a shutdown signal ─────────
    let dispatch_result = tokio::select! {
        result = &mut dispatch_handle => result,

        () = shutdown_signal() => {
            info!("shutdown signal received");
            shutdown.cancel();
            // Backstop for an engine call that ignores cooperative
            // cancellation.
            abort::arm_hard_exit(HARD_EXIT_GRACE);
            dispatch_handle.await
        }
    };

    match dispatch_result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(%err, "dispatcher failed");
            return Err(err);
        }
        Err(err) => {
            error!(%err, "dispatcher task panicked");
            return Err(AppError::Io(format!("dispatcher task failed: {err}")));
        }
    }

    // The dispatcher settling drops every outbound sender; the writer
    // drains the remaining lines and exits on its own.
    match writer_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%err, "writer ended with error"),
        Err(err) => warn!(%err, "writer task failed"),
    }

    info!("agent-sidecar shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stderr only: stdout is reserved for protocol lines.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
