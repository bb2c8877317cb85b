//! Engine configuration parsing and semantic validation.

use serde_json::json;

use agent_sidecar::config::EngineConfig;
use agent_sidecar::AppError;

fn parse(value: serde_json::Value) -> EngineConfig {
    serde_json::from_value(value).expect("config must deserialise")
}

#[test]
fn minimal_one_shot_config_is_valid() {
    let config = parse(json!({"model": "engine-large", "prompt": "hello"}));
    config.validate().expect("model plus prompt is sufficient");
}

#[test]
fn every_field_is_optional_at_the_serde_layer() {
    // A structurally valid envelope must always parse so the error can be
    // tagged with its request id; requirements are semantic, not structural.
    let config = parse(json!({}));
    assert!(config.model.is_none());
    assert!(config.validate().is_err());
}

#[test]
fn unknown_fields_are_tolerated() {
    let config = parse(json!({
        "model": "engine-large",
        "prompt": "hello",
        "some_future_field": {"nested": true},
    }));
    config.validate().expect("unknown fields never reject a request");
}

#[test]
fn missing_model_is_a_config_error() {
    let config = parse(json!({"prompt": "hello"}));
    let err = config.validate().expect_err("model is required");
    assert!(matches!(&err, AppError::Config(msg) if msg.contains("model")), "got: {err}");
}

#[test]
fn whitespace_model_is_rejected() {
    let config = parse(json!({"model": "   ", "prompt": "hello"}));
    assert!(config.validate().is_err());
}

#[test]
fn close_without_a_session_is_rejected() {
    let config = parse(json!({"model": "engine-large", "close_session": true}));
    let err = config.validate().expect_err("close needs a session id");
    assert!(
        matches!(&err, AppError::Config(msg) if msg.contains("session_id")),
        "got: {err}"
    );
}

#[test]
fn close_with_a_session_needs_no_prompt() {
    let config = parse(json!({
        "model": "engine-large",
        "session_id": "sess-1",
        "close_session": true,
    }));
    config.validate().expect("close is a complete instruction by itself");
}

#[test]
fn missing_prompt_without_close_is_rejected() {
    let config = parse(json!({"model": "engine-large", "session_id": "sess-1"}));
    let err = config.validate().expect_err("a non-close request needs content");
    assert!(
        matches!(&err, AppError::Config(msg) if msg.contains("prompt")),
        "got: {err}"
    );
}

#[test]
fn passthrough_fields_deserialise() {
    let config = parse(json!({
        "model": "engine-large",
        "prompt": "hello",
        "cwd": "/tmp/work",
        "allowed_capabilities": ["read", "edit"],
        "max_turns": 12,
        "resume": "prior-conversation",
        "feature_flags": {"fast_mode": true, "beta_tools": false},
        "api_key": "sk-test",
    }));

    assert_eq!(config.allowed_capabilities, vec!["read", "edit"]);
    assert_eq!(config.max_turns, Some(12));
    assert_eq!(config.resume.as_deref(), Some("prior-conversation"));
    assert_eq!(config.feature_flags.get("fast_mode"), Some(&true));
    assert_eq!(config.api_key.as_deref(), Some("sk-test"));
    config.validate().expect("full config is valid");
}
