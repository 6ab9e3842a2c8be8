//! SSH transport to benchmark hosts.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::TransportError;
use crate::shell::{CommandOutput, LocalCommand};

/// Remote working directory; created on first use by every command.
pub const REMOTE_DEPLOY_DIR: &str = "~/deploy";

const FILE_WRITE_TIMEOUT: Duration = Duration::from_secs(300);

/// Where and how to reach a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub username: String,
    pub port: u16,
    pub key_path: PathBuf,
}

impl SshTarget {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        port: u16,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            port,
            key_path: key_path.into(),
        }
    }

    /// `user@host`, or just `host` without a username.
    pub fn address(&self) -> String {
        if self.username.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.username, self.host)
        }
    }
}

/// Command execution and file transfer against a host.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Run `command` inside [`REMOTE_DEPLOY_DIR`].
    ///
    /// Non-zero exits come back as `Ok` with the exit code set.
    async fn run_command(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError>;

    /// Write `content` to `path`, relative to [`REMOTE_DEPLOY_DIR`].
    async fn write_file(
        &self,
        target: &SshTarget,
        path: &str,
        content: &str,
    ) -> Result<(), TransportError>;

    /// Single SSH reachability attempt.
    async fn probe(&self, target: &SshTarget) -> bool;
}

/// [`RemoteTransport`] backed by the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh_program: String,
    dry_run: bool,
}

impl SshTransport {
    pub fn new() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            dry_run: false,
        }
    }

    /// Log commands instead of running them.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_ssh_program(mut self, program: impl Into<String>) -> Self {
        self.ssh_program = program.into();
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn base_command(&self, target: &SshTarget, extra_opts: &[&str]) -> LocalCommand {
        let mut cmd = LocalCommand::new(&self.ssh_program).args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "BatchMode=yes",
            "-o",
            "ServerAliveInterval=60",
            "-o",
            "ServerAliveCountMax=5",
        ]);
        for opt in extra_opts {
            cmd = cmd.args(["-o", opt]);
        }
        if !target.key_path.as_os_str().is_empty() {
            cmd = cmd.arg("-i").arg(target.key_path.display().to_string());
        }
        if target.port != 22 {
            cmd = cmd.arg("-p").arg(target.port.to_string());
        }
        cmd.arg(target.address())
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a command so it runs in the deploy directory.
///
/// Docker commands run under the `docker` group via `sg`, since the group
/// membership added during host setup only applies to new login sessions.
pub fn wrap_remote_command(command: &str) -> String {
    let trimmed = command.trim_start();
    if trimmed.starts_with("docker") {
        let escaped = command
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('$', "\\$")
            .replace('`', "\\`");
        format!(
            "mkdir -p {dir} && sg docker -c \"cd {dir} && {escaped}\"",
            dir = REMOTE_DEPLOY_DIR
        )
    } else {
        format!(
            "mkdir -p {dir} && cd {dir} && {command}",
            dir = REMOTE_DEPLOY_DIR
        )
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn run_command(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let full = wrap_remote_command(command);
        if self.dry_run {
            info!("[dry-run] ssh {}: {}", target.address(), full);
            return Ok(CommandOutput::ok());
        }
        self.base_command(target, &[]).arg(full).run(timeout).await
    }

    async fn write_file(
        &self,
        target: &SshTarget,
        path: &str,
        content: &str,
    ) -> Result<(), TransportError> {
        let remote_path = format!("{}/{}", REMOTE_DEPLOY_DIR, path);
        if self.dry_run {
            info!("[dry-run] write {} -> {}:{}", path, target.address(), remote_path);
            return Ok(());
        }
        let script = format!(
            "mkdir -p {} && cat > {}",
            REMOTE_DEPLOY_DIR, remote_path
        );
        self.base_command(target, &[])
            .arg(script)
            .with_stdin(content)
            .run(FILE_WRITE_TIMEOUT)
            .await?
            .into_result()
            .map(|_| ())
    }

    async fn probe(&self, target: &SshTarget) -> bool {
        if self.dry_run {
            info!("[dry-run] ssh {}: true", target.address());
            return true;
        }
        matches!(
            self.base_command(target, &["ConnectTimeout=5"])
                .arg("true")
                .run(Duration::from_secs(30))
                .await,
            Ok(out) if out.success()
        )
    }
}
