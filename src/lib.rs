#![forbid(unsafe_code)]

//! `agent-sidecar` — long-lived AI completion worker.
//!
//! Spawned by a host desktop application, the worker executes
//! conversation-engine requests and streams results back over a UTF-8
//! newline-delimited JSON protocol on stdio. At most one engine invocation
//! is active at any time (single-flight); a new request preempts and drains
//! a still-running predecessor before starting.

pub mod abort;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod session;
pub mod wire;

pub use config::EngineConfig;
pub use errors::{AppError, Result};
