//! Error taxonomy shared by every subsystem.
//!
//! Exceptions raised by *user* code never show up here: the execution
//! engine reports them in-band through `ExecutionResult::error`. A
//! `SandboxError` always means the sandbox itself could not do what was
//! asked.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the sandbox core.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// A VM, run or file that the caller expected does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The session is not live (never created, destroyed or evicted).
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// Caller broke a rule the core enforces: cell-magic placement,
    /// out-of-workdir paths, resolving a run that is not waiting for input.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// The agent did not answer within its budget.
    #[error("agent did not respond within {0:?}")]
    TransportTimeout(Duration),

    /// The container runtime or the agent inside it misbehaved.
    #[error("sandbox failure: {0}")]
    SandboxFailure(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// Process exit code used by the CLI for this failure.
    ///
    /// Transport timeouts exit with 2; everything else with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            SandboxError::TransportTimeout(_) => 2,
            _ => 1,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SandboxError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
