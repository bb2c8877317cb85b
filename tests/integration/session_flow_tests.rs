//! Streaming-session behaviour end to end through the dispatcher: push and
//! close routing, output attribution, exhaustion, and offline refusal.

use serde_json::json;
use serial_test::serial;

use agent_sidecar::config::set_offline_mode;

use super::test_helpers::{
    session_close, session_request, spawn_dispatcher, Behavior, ScriptedEngine,
};

// ── Turn flow ─────────────────────────────────────────────────────────────────

/// Start, push, close: every turn is echoed with a `turn_complete` marker,
/// pushes complete immediately, and the close ends the engine call.
#[tokio::test]
async fn session_echoes_each_turn_until_closed() {
    let engine = ScriptedEngine::new(vec![Behavior::EchoTurns { delay_ms: 0 }]);
    let mut h = spawn_dispatcher(engine.clone());
    h.expect_ready().await;

    h.send(session_request("req-1", "sess-1", "first")).await;
    let first_turn = h.recv_until(|l| l["type"] == "turn_complete").await;
    let echo = first_turn
        .iter()
        .find(|l| l["type"] == "assistant")
        .expect("first turn must be echoed");
    assert_eq!(echo["content"], "first");
    assert_eq!(echo["request_id"], "req-1");

    h.send(session_request("req-2", "sess-1", "second")).await;
    let second_turn = h.recv_until(|l| l["type"] == "turn_complete").await;
    assert!(
        second_turn
            .iter()
            .any(|l| l["type"] == "request_complete" && l["request_id"] == "req-2"),
        "pushes complete immediately: {second_turn:?}"
    );
    let echo = second_turn
        .iter()
        .find(|l| l["type"] == "assistant")
        .expect("second turn must be echoed");
    assert_eq!(echo["content"], "second");
    assert_eq!(echo["request_id"], "req-2");

    h.send(session_close("req-3", "sess-1")).await;
    // Both terminal markers race on the outbound channel; wait for the pair.
    let completes = std::cell::Cell::new(0);
    let tail = h
        .recv_until(|l| {
            if l["type"] == "request_complete" {
                completes.set(completes.get() + 1);
            }
            completes.get() == 2
        })
        .await;
    for id in ["req-1", "req-3"] {
        assert!(
            tail.iter()
                .any(|l| l["type"] == "request_complete" && l["request_id"] == id),
            "missing completion for {id}: {tail:?}"
        );
    }
    assert!(
        !tail.iter().any(|l| l["type"] == "session_exhausted"),
        "an explicit close is not exhaustion: {tail:?}"
    );
    assert_eq!(engine.invocations(), 1, "one engine call spans all turns");
}

/// Output attribution follows the most recent push: a turn pushed while the
/// previous turn's output is still in flight claims that output's tag.
#[tokio::test]
async fn in_flight_output_is_retagged_by_a_newer_push() {
    let engine = ScriptedEngine::new(vec![Behavior::EchoTurns { delay_ms: 200 }]);
    let mut h = spawn_dispatcher(engine);
    h.expect_ready().await;

    // The echo of "a" is delayed; push "b" while it is still pending.
    h.send(session_request("req-1", "sess-1", "a")).await;
    h.send(session_request("req-2", "sess-1", "b")).await;

    let lines = h
        .recv_until(|l| l["type"] == "assistant" && l["content"] == "a")
        .await;
    let echo_a = lines.last().expect("matched line is last");
    assert_eq!(
        echo_a["request_id"], "req-2",
        "the newest push owns all in-flight output: {lines:?}"
    );

    h.send(session_close("req-3", "sess-1")).await;
    h.recv_until(|l| l["type"] == "request_complete" && l["request_id"] == "req-1")
        .await;
}

/// Closing a session before the engine produced anything yields only the
/// completion markers: no engine output, no exhaustion event.
#[tokio::test]
async fn close_before_output_yields_no_engine_messages() {
    let engine = ScriptedEngine::new(vec![Behavior::DrainTurns]);
    let mut h = spawn_dispatcher(engine);
    h.expect_ready().await;

    h.send(session_request("req-1", "sess-1", "hello")).await;
    h.send(session_close("req-2", "sess-1")).await;

    let lines = h
        .recv_until(|l| l["type"] == "request_complete" && l["request_id"] == "req-1")
        .await;
    for line in &lines {
        assert!(
            line["type"] == "request_complete",
            "only completion markers expected: {line}"
        );
    }
}

// ── Exhaustion and eviction ───────────────────────────────────────────────────

/// An engine that stops on its own exhausts the session: the host gets a
/// `session_exhausted` event and the id becomes reusable.
#[tokio::test]
async fn unprompted_engine_end_exhausts_and_evicts_the_session() {
    let engine = ScriptedEngine::new(vec![
        Behavior::Script(vec![json!({"type": "result", "is_error": false})]),
        Behavior::Script(vec![]),
    ]);
    let mut h = spawn_dispatcher(engine.clone());
    h.expect_ready().await;

    h.send(session_request("req-1", "sess-1", "hello")).await;
    let lines = h
        .recv_until(|l| l["type"] == "request_complete" && l["request_id"] == "req-1")
        .await;
    let exhausted = lines
        .iter()
        .find(|l| l["type"] == "session_exhausted")
        .expect("unprompted end must be reported");
    assert_eq!(exhausted["session_id"], "sess-1");
    assert_eq!(exhausted["request_id"], "req-1");

    // The id was evicted: reusing it starts a fresh engine call instead of
    // pushing into a dead session.
    h.send(session_request("req-2", "sess-1", "again")).await;
    h.recv_until(|l| l["type"] == "request_complete" && l["request_id"] == "req-2")
        .await;
    assert_eq!(engine.invocations(), 2);
}

/// A mid-stream engine error inside a session is relayed as a tagged error
/// event; the worker itself stays healthy.
#[tokio::test]
async fn session_engine_error_is_relayed_not_fatal() {
    let engine = ScriptedEngine::new(vec![Behavior::ScriptThenError(
        vec![json!({"type": "assistant", "stop_reason": "end_turn", "content": "partial"})],
        "engine connection lost".into(),
    )]);
    let mut h = spawn_dispatcher(engine);
    h.expect_ready().await;

    h.send(session_request("req-1", "sess-1", "hello")).await;
    let lines = h
        .recv_until(|l| l["type"] == "request_complete" && l["request_id"] == "req-1")
        .await;
    assert!(
        lines
            .iter()
            .any(|l| l["type"] == "error" && l["request_id"] == "req-1"),
        "engine error must surface as a tagged event: {lines:?}"
    );

    h.send(json!({"type": "ping"})).await;
    assert_eq!(h.recv().await, json!({"type": "pong"}));
}

// ── Cancel routing ────────────────────────────────────────────────────────────

/// Cancelling the request that started a session closes the session quietly.
#[tokio::test]
async fn cancel_of_session_start_closes_the_session() {
    let engine = ScriptedEngine::new(vec![Behavior::HangUntilCancel]);
    let mut h = spawn_dispatcher(engine);
    h.expect_ready().await;

    h.send(session_request("req-1", "sess-1", "hello")).await;
    h.send(json!({"type": "cancel", "request_id": "req-1"})).await;

    let lines = h
        .recv_until(|l| l["type"] == "request_complete" && l["request_id"] == "req-1")
        .await;
    assert!(
        !lines.iter().any(|l| l["type"] == "error"),
        "cancellation is not an error: {lines:?}"
    );
}

/// A push's request id never becomes cancelable: only the execution that
/// started the session owns the abort.
#[tokio::test]
async fn cancel_of_a_push_id_is_a_no_op() {
    let engine = ScriptedEngine::new(vec![Behavior::EchoTurns { delay_ms: 0 }]);
    let mut h = spawn_dispatcher(engine);
    h.expect_ready().await;

    h.send(session_request("req-1", "sess-1", "first")).await;
    h.recv_until(|l| l["type"] == "turn_complete").await;

    h.send(session_request("req-2", "sess-1", "second")).await;
    h.recv_until(|l| l["type"] == "turn_complete").await;

    h.send(json!({"type": "cancel", "request_id": "req-2"})).await;

    // Session still accepts turns after the no-op cancel.
    h.send(session_request("req-3", "sess-1", "third")).await;
    let lines = h.recv_until(|l| l["type"] == "turn_complete").await;
    let echo = lines
        .iter()
        .find(|l| l["type"] == "assistant")
        .expect("session must still echo");
    assert_eq!(echo["content"], "third");

    h.send(session_close("req-4", "sess-1")).await;
    h.recv_until(|l| l["type"] == "request_complete" && l["request_id"] == "req-1")
        .await;
}

// ── Offline mode ──────────────────────────────────────────────────────────────

/// Offline test mode refuses streaming sessions without touching the engine:
/// a tagged error, an immediate `turn_complete`, then the completion marker.
#[tokio::test]
#[serial]
async fn offline_mode_refuses_sessions_without_an_engine_call() {
    set_offline_mode(true);

    let engine = ScriptedEngine::new(vec![]);
    let mut h = spawn_dispatcher(engine.clone());
    h.expect_ready().await;

    h.send(session_request("req-1", "sess-1", "hello")).await;
    let lines = h
        .recv_until(|l| l["type"] == "request_complete" && l["request_id"] == "req-1")
        .await;

    set_offline_mode(false);

    let types: Vec<&str> = lines
        .iter()
        .map(|l| l["type"].as_str().unwrap_or_default())
        .collect();
    assert_eq!(types, vec!["error", "turn_complete", "request_complete"]);
    assert!(lines.iter().all(|l| l["request_id"] == "req-1"));
    assert_eq!(engine.invocations(), 0);
}
