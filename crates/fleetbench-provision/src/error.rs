//! Provisioning errors.

use std::path::PathBuf;

use thiserror::Error;

use fleetbench_core::{CoreError, ProviderKind};
use fleetbench_remote::TransportError;

/// Errors raised while creating, polling or deleting VMs.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Domain error (unknown GPU, bad state transition).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// No adapter registered for a provider.
    #[error("No provider adapter registered for {0}")]
    NoProvider(ProviderKind),

    /// Required credential is not set.
    #[error("{0} env var required for provisioning")]
    MissingCredential(&'static str),

    /// SSH key could not be read.
    #[error("Failed to read SSH key {path}: {source}")]
    SshKey {
        path: PathBuf,
        source: std::io::Error,
    },

    /// HTTP transport error talking to a provider API.
    #[error("Provider API request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider API returned something unusable.
    #[error("Provider API error: {0}")]
    Api(String),

    /// Local CLI invocation failed.
    #[error("Provider command failed: {0}")]
    Command(#[from] TransportError),

    /// Provider reported a failure status.
    #[error("Instance {instance} reached failure status '{status}'")]
    ProviderFailed { instance: String, status: String },

    /// Provider never reported active.
    #[error("Timeout after {timeout_secs}s waiting for {instance} to become active (last status: '{last_status}')")]
    ProvisionTimeout {
        instance: String,
        timeout_secs: u64,
        last_status: String,
    },

    /// SSH never became reachable.
    #[error("Timeout after {timeout_secs}s waiting for SSH connectivity to {address}")]
    SshTimeout { address: String, timeout_secs: u64 },

    /// Connection descriptor missing required fields.
    #[error("Invalid connection info for {instance}: {reason}")]
    InvalidConnection { instance: String, reason: String },

    /// Instance registry I/O or parse failure.
    #[error("Instance registry error at {path}: {reason}")]
    Registry { path: PathBuf, reason: String },
}
