//! FleetBench remote transport.
//!
//! Runs commands on the local machine ([`LocalCommand`], [`LocalTransport`])
//! and on benchmark hosts over SSH ([`SshTransport`]). Every failure,
//! including a non-zero exit, comes back as a value; callers decide whether
//! it is fatal.

pub mod error;
pub mod local;
pub mod shell;
pub mod ssh;

pub use error::TransportError;
pub use local::LocalTransport;
pub use shell::{CommandOutput, LocalCommand};
pub use ssh::{RemoteTransport, SshTarget, SshTransport, REMOTE_DEPLOY_DIR};
