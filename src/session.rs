//! Stateful multi-turn streaming sessions.
//!
//! A [`StreamingSession`] bridges the host's push-based turns to the
//! engine's pull-driven input interface. The bridge is an explicit state
//! machine: a single-slot pending-consumer continuation (at most one
//! outstanding "waiting for next input" point) plus an unbounded FIFO for
//! messages pushed during the window before the loop reaches its await
//! point. Queued messages preserve push order and are never dropped while
//! the session is live.
//!
//! Output attribution: every forwarded engine message is tagged with the
//! session's *current* request id at the moment of emission. A new push can
//! arrive while a prior turn's output is still flowing, so this id can
//! change mid-stream. Most recent push wins the tag; there is no per-turn
//! correlation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::abort::AbortState;
use crate::config;
use crate::engine::{ConversationEngine, EngineInput, TurnStream};
use crate::executor::apply_credential;
use crate::wire::envelope::{self, WorkRequest};
use crate::{AppError, Result};

/// Registry of live sessions, keyed by session id.
///
/// Owned by the dispatcher; each session loop removes its own entry on the
/// way out so an evicted id can be reused for a fresh session.
pub type SessionRegistry = Arc<Mutex<HashMap<String, Arc<StreamingSession>>>>;

// ── Session state machine ─────────────────────────────────────────────────────

/// Mutable session state behind the mutex.
struct SessionState {
    /// Request id all output is currently attributed to; reassigned on
    /// every push.
    current_request_id: String,
    /// Single-slot continuation for a parked input pull.
    pending: Option<oneshot::Sender<Option<String>>>,
    /// Turns pushed before the consumer was ready, in push order.
    queue: VecDeque<String>,
    /// Terminal flag; set exactly once.
    closed: bool,
}

/// A stateful wrapper around one long-lived engine conversation.
pub struct StreamingSession {
    session_id: String,
    state: Mutex<SessionState>,
}

impl StreamingSession {
    /// Create a session owned by the request that started it.
    #[must_use]
    pub fn new(session_id: &str, initial_request_id: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            state: Mutex::new(SessionState {
                current_request_id: initial_request_id.to_owned(),
                pending: None,
                queue: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// The session's identifier.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The request id in-flight output is attributed to right now.
    #[must_use]
    pub fn current_request_id(&self) -> String {
        self.state().current_request_id.clone()
    }

    /// Whether the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Push the next turn into the session.
    ///
    /// Reassigns the current request id, then either resolves a parked
    /// consumer immediately or enqueues the message for the next pull.
    /// Pushing into a closed session retags but discards the message: the
    /// generator has already returned and nothing will pull it.
    pub fn push(&self, request_id: &str, message: String) {
        let mut state = self.state();
        state.current_request_id = request_id.to_owned();

        if state.closed {
            warn!(
                session_id = self.session_id,
                request_id, "push into closed session discarded"
            );
            return;
        }

        if let Some(consumer) = state.pending.take() {
            if let Err(Some(unconsumed)) = consumer.send(Some(message)) {
                // Consumer side vanished between parking and delivery;
                // requeue so the turn is not lost.
                state.queue.push_back(unconsumed);
            }
        } else {
            state.queue.push_back(message);
        }
    }

    /// Close the session. Idempotent.
    ///
    /// A parked consumer is resolved with the end sentinel exactly once,
    /// which makes the input generator return and ends the engine's input
    /// stream together with the underlying call.
    pub fn close(&self) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        state.closed = true;

        if let Some(consumer) = state.pending.take() {
            let _ = consumer.send(None);
        }

        debug!(session_id = self.session_id, "session closed");
    }

    /// Pull the next input turn, parking until `push` or `close`.
    ///
    /// Drains the FIFO before parking: a turn pushed during the window
    /// before the loop reached this await point is delivered immediately
    /// instead of being lost to the race.
    async fn next_input(&self) -> Option<String> {
        let receiver = {
            let mut state = self.state();

            if let Some(queued) = state.queue.pop_front() {
                return Some(queued);
            }
            if state.closed {
                return None;
            }

            let (sender, receiver) = oneshot::channel();
            state.pending = Some(sender);
            receiver
        };

        // Sender dropped without sending counts as the end sentinel.
        receiver.await.unwrap_or(None)
    }

    /// Expose the session as the engine's single pull-driven input stream.
    ///
    /// The first pull always yields the initial prompt unconditionally;
    /// every subsequent pull goes through [`Self::next_input`].
    #[must_use]
    pub fn input_stream(self: &Arc<Self>, initial_prompt: String) -> TurnStream {
        let session = Arc::clone(self);
        Box::pin(stream::unfold(
            (session, Some(initial_prompt)),
            |(session, initial)| async move {
                if let Some(first) = initial {
                    return Some((first, (session, None)));
                }
                let next = session.next_input().await?;
                Some((next, (session, None)))
            },
        ))
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Session loop ──────────────────────────────────────────────────────────────

/// Run a streaming session's engine call until close or exhaustion.
///
/// Engine exceptions are caught here (unlike the one-shot executor), relayed
/// as an error event tagged with the current request id, and end the loop.
/// When the loop ends without an explicit close the session is exhausted:
/// the engine stopped consuming input unprompted, and a distinct
/// `session_exhausted` event tells the host. The session is always evicted
/// from the registry on the way out.
///
/// # Errors
///
/// - [`AppError::Config`] when the starting request's configuration is
///   invalid; no engine call is made.
/// - [`AppError::Io`] when the outbound channel has closed underneath the
///   session.
pub async fn run_session(
    engine: &dyn ConversationEngine,
    request: &WorkRequest,
    session: Arc<StreamingSession>,
    registry: SessionRegistry,
    abort: &AbortState,
    out_tx: &mpsc::Sender<serde_json::Value>,
) -> Result<()> {
    let result = drive_session(engine, request, &session, abort, out_tx).await;

    registry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(session.session_id());

    result
}

/// The session loop proper; eviction is handled by [`run_session`].
async fn drive_session(
    engine: &dyn ConversationEngine,
    request: &WorkRequest,
    session: &Arc<StreamingSession>,
    abort: &AbortState,
    out_tx: &mpsc::Sender<serde_json::Value>,
) -> Result<()> {
    request.config.validate()?;

    // Offline test mode: streaming sessions are explicitly unsupported.
    // Fail fast with an explanatory error plus an immediate turn-complete
    // rather than attempting a real call.
    if config::offline_mode() {
        let request_id = session.current_request_id();
        session.close();
        send_line(
            out_tx,
            envelope::request_error(
                &request_id,
                "streaming sessions are not supported in offline mode",
            ),
        )
        .await?;
        send_line(out_tx, envelope::turn_complete(&request_id)).await?;
        return Ok(());
    }

    apply_credential(&request.config);

    let initial_prompt = request.config.prompt.clone().unwrap_or_default();
    let inputs = session.input_stream(initial_prompt);

    let mut stream = match engine
        .invoke(&request.config, EngineInput::Turns(inputs), abort.token())
        .await
    {
        Ok(stream) => stream,
        Err(err) => {
            let request_id = session.current_request_id();
            warn!(
                session_id = session.session_id(),
                request_id,
                %err,
                "session engine invocation failed"
            );
            session.close();
            send_line(out_tx, envelope::request_error(&request_id, &err.to_string())).await?;
            return Ok(());
        }
    };

    let cancel = abort.token();
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id = session.session_id(), "session aborted, closing");
                session.close();
                break;
            }

            item = stream.next() => {
                match item {
                    None => break,
                    Some(Ok(message)) => {
                        // Most recent push wins the attribution tag.
                        let request_id = session.current_request_id();
                        let ends_turn = message.ends_turn();

                        send_line(out_tx, envelope::tagged(&request_id, message)).await?;
                        if ends_turn {
                            send_line(out_tx, envelope::turn_complete(&request_id)).await?;
                        }
                    }
                    Some(Err(err)) => {
                        let request_id = session.current_request_id();
                        warn!(
                            session_id = session.session_id(),
                            request_id,
                            %err,
                            "session engine error, ending loop"
                        );
                        send_line(
                            out_tx,
                            envelope::request_error(&request_id, &err.to_string()),
                        )
                        .await?;
                        break;
                    }
                }
            }
        }
    }

    if !session.is_closed() {
        // Unprompted exhaustion: the engine stopped consuming input without
        // being told to. The host needs to know the session is gone.
        session.close();
        send_line(
            out_tx,
            envelope::session_exhausted(&session.current_request_id(), session.session_id()),
        )
        .await?;
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
