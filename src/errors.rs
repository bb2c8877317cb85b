//! Error types shared across the worker.

use std::fmt::{Display, Formatter};

/// Shared worker result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Worker error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Request configuration parsing or validation failure.
    Config(String),
    /// Wire protocol framing or envelope failure.
    Protocol(String),
    /// Conversation engine invocation failure.
    Engine(String),
    /// Streaming session state failure.
    Session(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Engine(msg) => write!(f, "engine: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
