//! Local subprocess execution with a deadline.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; -1 if the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Synthetic success, used by dry-run paths.
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`TransportError::NonZeroExit`].
    pub fn into_result(self) -> Result<CommandOutput, TransportError> {
        if self.success() {
            Ok(self)
        } else {
            Err(TransportError::NonZeroExit {
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// A command to run on this machine.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use fleetbench_remote::LocalCommand;
///
/// async fn run() -> Result<(), Box<dyn std::error::Error>> {
///     let out = LocalCommand::new("gcloud")
///         .args(["compute", "instances", "list"])
///         .run(Duration::from_secs(60))
///         .await?;
///     println!("{}", out.stdout);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct LocalCommand {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    current_dir: Option<PathBuf>,
    dry_run: bool,
}

impl LocalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            current_dir: None,
            dry_run: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed `input` to the process on stdin.
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Run the process in `dir`.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Log the command instead of running it.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Program and arguments joined for display.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        parts.join(" ")
    }

    /// Run to completion or until `timeout`, capturing stdout and stderr.
    ///
    /// A non-zero exit is returned as `Ok` with the exit code set.
    pub async fn run(self, timeout: Duration) -> Result<CommandOutput, TransportError> {
        if self.dry_run {
            info!("[dry-run] {}", self.display());
            return Ok(CommandOutput::ok());
        }

        let display_cmd = self.display();
        debug!(command = %display_cmd, "Spawning process");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransportError::NotFound(self.program.clone())
            } else {
                TransportError::Io(e)
            }
        })?;

        if let Some(input) = &self.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
                pipe.shutdown().await?;
            }
        }

        // Dropping the future on timeout drops the child, which kills it.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                let exit_code = output.status.code().unwrap_or(-1);
                debug!(command = %display_cmd, exit_code, "Process exited");
                Ok(CommandOutput {
                    exit_code,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => {
                warn!(command = %display_cmd, timeout_secs = timeout.as_secs(), "Command timed out");
                Err(TransportError::Timeout {
                    command: display_cmd,
                    timeout,
                })
            }
        }
    }
}
