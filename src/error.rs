//! Failure taxonomy for a code-execution session.

use std::fmt;
use thiserror::Error;

/// Which resource ceiling a run ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ceiling {
    Timeout,
    Memory,
    Output,
}

impl fmt::Display for Ceiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ceiling::Timeout => f.write_str("time limit"),
            Ceiling::Memory => f.write_str("memory limit"),
            Ceiling::Output => f.write_str("output limit"),
        }
    }
}

/// Errors surfaced to a client. The `Display` text is sent verbatim in an
/// `error` frame.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Failed to prepare workspace: {0}")]
    WorkspacePrepare(#[source] std::io::Error),
    #[error("Compilation failed:\n{0}")]
    Compile(String),
    #[error("Failed to start program: {0}")]
    Launch(String),
    #[error("Program exceeded its {0}")]
    ResourceExceeded(Ceiling),
    #[error("Invalid message: {0}")]
    Protocol(String),
    #[error("Client disconnected")]
    PeerDisconnected,
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Protocol(err.to_string())
    }
}
