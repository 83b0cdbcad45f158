//! Protocol errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while talking to the target REPL
#[derive(Error, Debug)]
pub enum ReplError {
    /// An expected banner, acknowledgment, prompt or data did not arrive in time
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// The transport refused bytes or the read primitive failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unexpected byte or malformed handshake response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Remote code raised, or the command-accepted acknowledgment was wrong
    #[error("Execution error: {0}")]
    Execution(String),

    /// A raw-REPL operation was invoked while not in raw REPL
    #[error("Not in expected mode: {0}")]
    NotInExpectedMode(String),

    /// Caller supplied an argument the operation refuses
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serializable classification of a [`ReplError`], used to report which step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`ReplError::Timeout`]
    Timeout,
    /// See [`ReplError::Transport`] and [`ReplError::Io`]
    Transport,
    /// See [`ReplError::Protocol`]
    Protocol,
    /// See [`ReplError::Execution`]
    Execution,
    /// See [`ReplError::NotInExpectedMode`]
    NotInExpectedMode,
    /// See [`ReplError::InvalidArgument`]
    InvalidArgument,
}

impl ErrorKind {
    /// Whether the link may be out of sync with the target after this failure.
    ///
    /// Callers should run `ensure_idle` before retrying when this is true.
    pub fn needs_resync(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Transport | ErrorKind::Protocol
        )
    }
}

impl ReplError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReplError::Timeout(_) => ErrorKind::Timeout,
            ReplError::Transport(_) | ReplError::Io(_) => ErrorKind::Transport,
            ReplError::Protocol(_) => ErrorKind::Protocol,
            ReplError::Execution(_) => ErrorKind::Execution,
            ReplError::NotInExpectedMode(_) => ErrorKind::NotInExpectedMode,
            ReplError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    pub(crate) fn timeout(what: impl Into<String>) -> Self {
        ReplError::Timeout(what.into())
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        ReplError::Transport(err.to_string())
    }
}
