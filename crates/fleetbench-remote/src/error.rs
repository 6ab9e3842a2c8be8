//! Error types for command execution.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while running local or remote commands.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Executable not found on PATH.
    #[error("'{0}' not found. Is it installed and on PATH?")]
    NotFound(String),

    /// Failed to spawn or talk to the process.
    #[error("Failed to run process: {0}")]
    Io(#[from] std::io::Error),

    /// Command ran past its deadline and was killed.
    #[error("Command timed out after {}s: {command}", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    /// Command exited non-zero.
    #[error("Command exited with code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },
}
