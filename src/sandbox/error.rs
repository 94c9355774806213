use std::time::Duration;

use super::result::ExecutionResult;

/// Error kinds surfaced by the execution engine.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("command blocked: {reason}")]
    CommandBlocked { reason: String },

    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("command timed out after {}s", timeout.as_secs())]
    ExecutionTimeout {
        timeout: Duration,
        result: Box<ExecutionResult>,
    },

    #[error("command cancelled")]
    Cancelled { result: Box<ExecutionResult> },

    #[error("failed to start sandboxed command: {0}")]
    SpawnFailure(String),

    #[error("rollback failed: {0}")]
    RollbackFailure(String),

    #[error("snapshot failed: {0}")]
    SnapshotFailure(String),
}

impl SandboxError {
    /// Partial result carried by timeouts and cancellations.
    pub fn partial_result(&self) -> Option<&ExecutionResult> {
        match self {
            SandboxError::ExecutionTimeout { result, .. } | SandboxError::Cancelled { result } => {
                Some(result)
            }
            _ => None,
        }
    }

    /// Short machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::CommandBlocked { .. } => "command_blocked",
            SandboxError::SandboxUnavailable(_) => "sandbox_unavailable",
            SandboxError::ExecutionTimeout { .. } => "execution_timeout",
            SandboxError::Cancelled { .. } => "cancelled",
            SandboxError::SpawnFailure(_) => "spawn_failure",
            SandboxError::RollbackFailure(_) => "rollback_failure",
            SandboxError::SnapshotFailure(_) => "snapshot_failure",
        }
    }
}
