//! Engine error types.

use std::path::PathBuf;

use thiserror::Error;

use fleetbench_provision::ProvisionError;
use fleetbench_remote::TransportError;

/// Errors loading `fleetbench.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config {0}: {1}")]
    Io(PathBuf, std::io::Error),

    /// Config file is not valid TOML or has the wrong shape.
    #[error("Failed to parse config {0}: {1}")]
    Parse(PathBuf, String),

    /// A required setting is absent.
    #[error("Missing required config setting '{0}'")]
    Missing(&'static str),
}

/// Errors appending to the run manifest.
///
/// These abort the run: without the manifest nothing can be audited.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// File system failure on the manifest.
    #[error("Manifest I/O error at {0}: {1}")]
    Io(PathBuf, std::io::Error),

    /// Could not take the manifest lock.
    #[error("Failed to lock manifest {0}: {1}")]
    Lock(PathBuf, std::io::Error),

    /// Manifest on disk is not valid JSON.
    #[error("Corrupt manifest {0}: {1}")]
    Parse(PathBuf, String),

    /// Another thread panicked while holding the manifest lock.
    #[error("Manifest lock poisoned")]
    Poisoned,

    /// The blocking manifest writer died before finishing.
    #[error("Manifest writer failed: {0}")]
    Worker(String),
}

/// Task-level deploy and benchmark failures.
///
/// Fatal to one task; the VM is kept for the rest of the group.
#[derive(Debug, Error)]
pub enum DeployError {
    /// SSH or subprocess failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A remote step exited non-zero.
    #[error("{step} failed with exit code {exit_code}")]
    StepFailed { step: &'static str, exit_code: i32 },

    /// Health endpoint never answered.
    #[error("Health check on port {port} timed out after {timeout_secs}s")]
    HealthTimeout { port: u16, timeout_secs: u64 },

    /// Model answered the smoke test, but wrongly.
    #[error("Smoke test failed: model returned wrong answer: {0:?}")]
    WrongAnswer(String),

    /// No usable smoke test response before the deadline.
    #[error("Smoke test timed out after {0}s")]
    SmokeTimeout(u64),

    /// Benchmark client exited non-zero.
    #[error("Benchmark client failed with exit code {0}")]
    Benchmark(i32),

    /// Result artifact could not be written.
    #[error("Failed to write result artifact {0}: {1}")]
    Artifact(PathBuf, std::io::Error),
}

/// Run-level errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Run directory could not be created.
    #[error("Failed to create run directory under {path}: {source}")]
    RunDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Run log sink could not be opened.
    #[error("Failed to open run log {path}: {source}")]
    RunLog {
        path: PathBuf,
        source: std::io::Error,
    },
}
