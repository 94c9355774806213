use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
    /// Dry-run: nothing was spawned.
    Previewed,
}

/// Outcome of one sandboxed run, or of a dry-run preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    /// Signal that terminated the process, if any.
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Ran to completion with exit code 0.
    pub success: bool,
    pub duration: Duration,
    pub termination: Termination,
    /// stdout or stderr hit the output cap.
    pub truncated: bool,
    pub preview: Option<String>,
}

impl ExecutionResult {
    pub(crate) fn exited(
        exit_code: Option<i32>,
        signal: Option<i32>,
        stdout: String,
        stderr: String,
        duration: Duration,
        truncated: bool,
    ) -> Self {
        Self {
            success: exit_code == Some(0),
            exit_code,
            signal,
            stdout,
            stderr,
            duration,
            termination: Termination::Exited,
            truncated,
            preview: None,
        }
    }

    pub(crate) fn interrupted(
        termination: Termination,
        stdout: String,
        stderr: String,
        duration: Duration,
        truncated: bool,
    ) -> Self {
        Self {
            exit_code: None,
            signal: Some(libc::SIGKILL),
            stdout,
            stderr,
            success: false,
            duration,
            termination,
            truncated,
            preview: None,
        }
    }

    pub(crate) fn previewed(preview: String) -> Self {
        Self {
            exit_code: None,
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
            success: false,
            duration: Duration::ZERO,
            termination: Termination::Previewed,
            truncated: false,
            preview: Some(preview),
        }
    }

    /// One-line description for logs and the CLI.
    pub fn summary(&self) -> String {
        match self.termination {
            Termination::Previewed => "dry-run, nothing executed".to_string(),
            Termination::TimedOut => format!("timed out after {:.1}s", self.duration.as_secs_f64()),
            Termination::Cancelled => format!("cancelled after {:.1}s", self.duration.as_secs_f64()),
            Termination::Exited => match (self.exit_code, self.signal) {
                (Some(code), _) => format!(
                    "exited with code {} in {:.1}s{}",
                    code,
                    self.duration.as_secs_f64(),
                    if self.truncated { ", output truncated" } else { "" }
                ),
                (None, Some(sig)) => format!("killed by signal {}", sig),
                (None, None) => "exited".to_string(),
            },
        }
    }
}
