//! Abort coordination for engine invocations.
//!
//! Each engine invocation owns one [`AbortState`]: an `aborted` flag plus a
//! [`CancellationToken`] that is passed into the engine call. Cancellation
//! is cooperative; the only backstop for an engine that ignores its token is
//! the [`arm_hard_exit`] grace-window timer, and that timer only arms on
//! process-level shutdown signals, never on a request-level cancel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Grace window between a shutdown signal and the forced process exit.
pub const HARD_EXIT_GRACE: Duration = Duration::from_millis(3000);

/// Cancellation state for a single engine invocation.
///
/// Cloning shares the same flag and token, so a clone handed to a spawned
/// task observes (and can trigger) the same abort.
#[derive(Debug, Clone)]
pub struct AbortState {
    aborted: Arc<AtomicBool>,
    token: CancellationToken,
}

impl AbortState {
    /// Create a fresh, untriggered abort state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
            token: CancellationToken::new(),
        }
    }

    /// Whether this invocation has been aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// The cancellation token passed into the engine call.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Mark the invocation aborted and fire the token. Idempotent.
    pub fn abort(&self) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
    }

    /// Compose this state with an externally supplied cancellation signal.
    ///
    /// If `external` has already been triggered the state is aborted
    /// immediately; otherwise a one-shot listener task aborts it when the
    /// external signal fires later. The listener exits on its own once this
    /// state's token is cancelled through any path.
    pub fn link(&self, external: &CancellationToken) {
        if external.is_cancelled() {
            debug!("external signal already triggered, aborting immediately");
            self.abort();
            return;
        }

        let state = self.clone();
        let external = external.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = external.cancelled() => {
                    debug!("external signal fired, aborting linked invocation");
                    state.abort();
                }
                () = state.token.cancelled() => {
                    // Invocation ended through its own abort; nothing to do.
                }
            }
        });
    }
}

impl Default for AbortState {
    fn default() -> Self {
        Self::new()
    }
}

/// Arm the forced-exit fallback for a signal-driven shutdown.
///
/// Spawns a task that sleeps for `grace` and then exits the process with
/// status 0. This is the backstop for an engine call that ignores
/// cooperative cancellation. A spawned task does not keep the runtime alive
/// once `main` returns, so a clean exit that happens first simply wins.
pub fn arm_hard_exit(grace: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        warn!(
            grace_ms = grace.as_millis(),
            "grace window elapsed without a clean exit, forcing process exit"
        );
        std::process::exit(0);
    });
}
