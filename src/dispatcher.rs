//! Protocol dispatcher: the worker's line-protocol read loop.
//!
//! Owns inbound parsing, the single-flight execution discipline, the
//! streaming-session registry, and shutdown draining. The loop itself never
//! blocks on engine work: requests run in spawned tasks so `ping`,
//! `shutdown`, and `cancel` stay responsive while work executes.
//!
//! Single-flight: at most one engine invocation is owned by the worker at a
//! time. A new `agent_request` preempts a still-running predecessor by
//! firing its abort and having the *new* task await the old task's
//! settlement before starting, which guarantees the old request's
//! `request_complete` marker is emitted before the new request's first
//! output line.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::abort::AbortState;
use crate::config::EngineConfig;
use crate::engine::ConversationEngine;
use crate::session::{self, SessionRegistry, StreamingSession};
use crate::wire::codec::WireCodec;
use crate::wire::envelope::{self, Inbound, WorkRequest};
use crate::{executor, AppError, Result};

/// The currently active execution, if any.
///
/// `handle` doubles as the in-flight registry: every new task awaits its
/// predecessor's handle first, so awaiting the newest handle drains the
/// whole chain.
struct ActiveExecution {
    request_id: String,
    abort: AbortState,
    handle: JoinHandle<()>,
}

/// Line-protocol dispatcher over the worker's input stream.
pub struct Dispatcher {
    engine: Arc<dyn ConversationEngine>,
    out_tx: mpsc::Sender<serde_json::Value>,
    shutdown: CancellationToken,
    sessions: SessionRegistry,
    active: Option<ActiveExecution>,
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// `shutdown` is the process-level signal token; it is linked into every
    /// execution's [`AbortState`] so a signal-driven shutdown cancels the
    /// active engine call cooperatively.
    #[must_use]
    pub fn new(
        engine: Arc<dyn ConversationEngine>,
        out_tx: mpsc::Sender<serde_json::Value>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            out_tx,
            shutdown,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            active: None,
        }
    }

    /// Run the read loop until `shutdown`, input EOF, or a signal.
    ///
    /// Emits the readiness line before accepting any request, and always
    /// drains in-flight work before returning, even when the input stream
    /// closes without an explicit `shutdown` (host died, pipe broke).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] when the outbound channel has closed, which
    /// means the writer task is gone and no protocol line can ever be
    /// delivered again.
    pub async fn run<R>(mut self, input: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.send(envelope::sidecar_ready()).await?;
        info!("worker ready, accepting requests");

        let mut framed = FramedRead::new(input, WireCodec::new());

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    info!("shutdown signal received, stopping read loop");
                    break;
                }

                item = framed.next() => {
                    match item {
                        None => {
                            debug!("input stream closed, draining before exit");
                            break;
                        }

                        Some(Err(AppError::Protocol(msg))) => {
                            // Framing error (e.g. line too long): reply and
                            // keep reading.
                            warn!(error = msg.as_str(), "framing error on input line");
                            self.send(envelope::protocol_error(&msg)).await?;
                        }

                        Some(Err(err)) => {
                            warn!(%err, "input stream error, draining before exit");
                            break;
                        }

                        Some(Ok(line)) => {
                            if !self.handle_line(&line).await? {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Handle one complete input line. Returns `false` on `shutdown`.
    async fn handle_line(&mut self, line: &str) -> Result<bool> {
        match envelope::parse_inbound(line) {
            // Empty line: silently skipped.
            Ok(None) => {}

            Err(err) => {
                warn!(%err, raw_line = line, "malformed input line");
                self.send(envelope::protocol_error(&err.to_string())).await?;
            }

            Ok(Some(Inbound::Ping)) => {
                self.send(envelope::pong()).await?;
            }

            Ok(Some(Inbound::Shutdown)) => {
                info!("shutdown requested by host");
                return Ok(false);
            }

            Ok(Some(Inbound::Cancel { request_id })) => {
                self.handle_cancel(&request_id);
            }

            Ok(Some(Inbound::AgentRequest { request_id, config })) => {
                self.handle_request(request_id, config).await?;
            }
        }

        Ok(true)
    }

    /// Fire the active execution's abort iff the id matches.
    ///
    /// Cancelling a superseded or unknown id is a silent no-op: under
    /// single-flight only the currently active request is cancelable.
    fn handle_cancel(&self, request_id: &str) {
        match &self.active {
            Some(active) if active.request_id == request_id => {
                info!(request_id, "cancel: aborting active execution");
                active.abort.abort();
            }
            _ => {
                debug!(request_id, "cancel: id is not the active execution, ignoring");
            }
        }
    }

    /// Route an `agent_request`: session push fast-path, or a new
    /// single-flight execution.
    async fn handle_request(&mut self, request_id: String, config: EngineConfig) -> Result<()> {
        // A live session consumes the request without a new engine
        // invocation; its completion marker is emitted immediately.
        if let Some(session_id) = &config.session_id {
            if let Some(session) = self.lookup_session(session_id) {
                if config.close_session {
                    session.close();
                } else if let Some(prompt) = config.prompt.clone() {
                    session.push(&request_id, prompt);
                } else {
                    self.send(envelope::request_error(&request_id, "missing prompt"))
                        .await?;
                }
                self.send(envelope::request_complete(&request_id)).await?;
                return Ok(());
            }

            if config.close_session {
                // Close is idempotent; an unknown session has nothing to do.
                debug!(session_id, request_id, "close for unknown session, no-op");
                self.send(envelope::request_complete(&request_id)).await?;
                return Ok(());
            }
        }

        // Single-flight: preempt any still-running previous execution. The
        // new task awaits the old handle so the old completion marker lands
        // first while this loop stays responsive.
        let previous = self.active.take();
        if let Some(prev) = &previous {
            info!(
                request_id,
                superseded = prev.request_id,
                "preempting outstanding execution"
            );
            prev.abort.abort();
        }

        let abort = AbortState::new();
        abort.link(&self.shutdown);

        // Register new sessions synchronously so an immediately-following
        // push cannot race a second session into existence.
        let session = config.session_id.as_ref().map(|session_id| {
            let session = Arc::new(StreamingSession::new(session_id, &request_id));
            self.lock_sessions()
                .insert(session_id.clone(), Arc::clone(&session));
            session
        });

        let request = WorkRequest {
            request_id: request_id.clone(),
            config,
        };
        let engine = Arc::clone(&self.engine);
        let registry = Arc::clone(&self.sessions);
        let out_tx = self.out_tx.clone();
        let task_abort = abort.clone();

        let handle = tokio::spawn(async move {
            if let Some(prev) = previous {
                let _ = prev.handle.await;
            }
            execute(&*engine, &request, session, registry, &task_abort, &out_tx).await;
        });

        self.active = Some(ActiveExecution {
            request_id,
            abort,
            handle,
        });

        Ok(())
    }

    /// Drain all in-flight work before exit.
    async fn drain(&mut self) {
        // Unblock parked session pulls so their executions can settle.
        let live: Vec<Arc<StreamingSession>> = self.lock_sessions().values().cloned().collect();
        for session in live {
            session.close();
        }

        if let Some(active) = self.active.take() {
            debug!(
                request_id = active.request_id,
                "waiting for in-flight executions to settle"
            );
            let _ = active.handle.await;
        }

        info!("dispatcher drained");
    }

    fn lookup_session(&self, session_id: &str) -> Option<Arc<StreamingSession>> {
        self.lock_sessions().get(session_id).cloned()
    }

    fn lock_sessions(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Arc<StreamingSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send one outbound line, mapping a closed channel to an I/O error.
    async fn send(&self, line: serde_json::Value) -> Result<()> {
        self.out_tx
            .send(line)
            .await
            .map_err(|_| AppError::Io("outbound channel closed".into()))
    }
}

/// Run one execution to its terminal marker.
///
/// The completion marker is emitted on every path out of the execution —
/// success, config error, engine error, or cancellation — so the host always
/// knows when the worker is free.
async fn execute(
    engine: &dyn ConversationEngine,
    request: &WorkRequest,
    session: Option<Arc<StreamingSession>>,
    registry: SessionRegistry,
    abort: &AbortState,
    out_tx: &mpsc::Sender<serde_json::Value>,
) {
    let result = match session {
        Some(session) => {
            session::run_session(engine, request, session, registry, abort, out_tx).await
        }
        None => executor::run_request(engine, request, abort, out_tx).await,
    };

    if let Err(err) = result {
        warn!(request_id = request.request_id, %err, "request failed");
        let _ = out_tx
            .send(envelope::request_error(&request.request_id, &err.to_string()))
            .await;
    }

    let _ = out_tx
        .send(envelope::request_complete(&request.request_id))
        .await;
}
