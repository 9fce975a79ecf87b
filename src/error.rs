//! Error types for agentmesh.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level failures. The offending envelope is dropped; the sender's
/// liveness is left alone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(i64),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Frame too large: more than {max} bytes")]
    FrameTooLarge { max: usize },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No agents available")]
    NoAgentsAvailable,

    #[error("Task table full ({capacity} active sessions)")]
    TaskTableFull { capacity: usize },

    #[error("Session {session_id} timed out after {}ms", waited.as_millis())]
    Timeout { session_id: String, waited: Duration },

    #[error("Agent {agent_id} reported failure: {message}")]
    Remote { agent_id: String, message: String },

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Node is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Timeouts are an expected outcome of a submission, not a failure;
    /// callers may retry at their discretion.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn transport(e: impl std::fmt::Display) -> Self {
        Error::Transport(e.to_string())
    }
}
