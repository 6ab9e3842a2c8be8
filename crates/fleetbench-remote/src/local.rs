//! Run deploy steps on this machine instead of a remote host.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::TransportError;
use crate::shell::{CommandOutput, LocalCommand};
use crate::ssh::{RemoteTransport, SshTarget};

/// [`RemoteTransport`] rooted at a local directory.
///
/// The target is ignored: commands run under `bash -c` in `work_dir` and
/// files are written there.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    work_dir: PathBuf,
    dry_run: bool,
}

impl LocalTransport {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn work_dir(&self) -> &PathBuf {
        &self.work_dir
    }
}

#[async_trait]
impl RemoteTransport for LocalTransport {
    async fn run_command(
        &self,
        _target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        LocalCommand::new("bash")
            .args(["-c", command])
            .current_dir(&self.work_dir)
            .with_dry_run(self.dry_run)
            .run(timeout)
            .await
    }

    async fn write_file(
        &self,
        _target: &SshTarget,
        path: &str,
        content: &str,
    ) -> Result<(), TransportError> {
        let dest = self.work_dir.join(path);
        if self.dry_run {
            info!("[dry-run] write {}", dest.display());
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.work_dir).await?;
        tokio::fs::write(&dest, content).await?;
        Ok(())
    }

    async fn probe(&self, _target: &SshTarget) -> bool {
        true
    }
}
