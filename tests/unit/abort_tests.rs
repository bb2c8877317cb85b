//! Abort-state semantics: idempotence, token wiring, and external linking.

use std::time::Duration;

use agent_sidecar::abort::AbortState;
use tokio_util::sync::CancellationToken;

#[test]
fn fresh_state_is_untriggered() {
    let abort = AbortState::new();
    assert!(!abort.is_aborted());
    assert!(!abort.token().is_cancelled());
}

#[test]
fn abort_sets_flag_and_fires_token() {
    let abort = AbortState::new();
    abort.abort();
    assert!(abort.is_aborted());
    assert!(abort.token().is_cancelled());
}

#[test]
fn abort_is_idempotent() {
    let abort = AbortState::new();
    abort.abort();
    abort.abort();
    assert!(abort.is_aborted());
}

#[test]
fn clones_share_the_same_flag_and_token() {
    let abort = AbortState::new();
    let clone = abort.clone();

    clone.abort();

    assert!(abort.is_aborted());
    assert!(abort.token().is_cancelled());
}

#[tokio::test]
async fn linking_an_already_cancelled_signal_aborts_immediately() {
    let external = CancellationToken::new();
    external.cancel();

    let abort = AbortState::new();
    abort.link(&external);

    assert!(abort.is_aborted());
}

#[tokio::test]
async fn external_signal_propagates_through_the_link() {
    let external = CancellationToken::new();
    let abort = AbortState::new();
    abort.link(&external);
    assert!(!abort.is_aborted());

    external.cancel();

    // The listener task relays the signal; wait on the token itself.
    tokio::time::timeout(Duration::from_secs(5), abort.token().cancelled())
        .await
        .expect("linked abort must fire");
    assert!(abort.is_aborted());
}

#[tokio::test]
async fn own_abort_never_cancels_the_external_signal() {
    let external = CancellationToken::new();
    let abort = AbortState::new();
    abort.link(&external);

    abort.abort();
    tokio::task::yield_now().await;

    assert!(!external.is_cancelled(), "linking is one-directional");
}
