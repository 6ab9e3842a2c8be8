//! Mirror recorded outcomes into git, one commit per task.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use fleetbench_core::TaskOutcome;
use fleetbench_remote::{CommandOutput, LocalCommand, TransportError};

use crate::recorder::OutcomeMirror;

const GIT_TIMEOUT: Duration = Duration::from_secs(120);
const PUSH_TIMEOUT: Duration = Duration::from_secs(60);

/// Commits the run directory after every recorded outcome.
///
/// One mirror operation is in flight at a time across all group workers, so
/// commits never interleave. Every failure is logged and swallowed. In dry-run
/// mode the git commands are logged and nothing is spawned.
#[derive(Debug)]
pub struct GitMirror {
    repo_dir: PathBuf,
    run_dir: PathBuf,
    push: bool,
    dry_run: bool,
    git_program: String,
    lock: Mutex<()>,
}

impl GitMirror {
    /// Mirror `run_dir` into the git work tree at `repo_dir`.
    pub fn new(repo_dir: impl Into<PathBuf>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            run_dir: run_dir.into(),
            push: true,
            dry_run: false,
            git_program: "git".to_string(),
            lock: Mutex::new(()),
        }
    }

    /// Push after each commit (default: true).
    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    /// Log git commands instead of running them.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_git_program(mut self, program: impl Into<String>) -> Self {
        self.git_program = program.into();
        self
    }

    fn git<I, S>(&self, args: I) -> LocalCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LocalCommand::new(&self.git_program)
            .arg("-C")
            .arg(self.repo_dir.display().to_string())
            .args(args)
            .with_dry_run(self.dry_run)
    }

    async fn commit(&self, outcome: &TaskOutcome) -> Result<(), TransportError> {
        let status = if outcome.status.is_success() {
            "pass"
        } else {
            "fail"
        };

        self.git(["add", "--force"])
            .arg(self.run_dir.display().to_string())
            .run(GIT_TIMEOUT)
            .await?
            .into_result()?;

        // A dry run has nothing staged to inspect; log the full sequence.
        let staged: CommandOutput = if self.dry_run {
            CommandOutput {
                exit_code: 1,
                ..CommandOutput::ok()
            }
        } else {
            self.git(["diff", "--cached", "--quiet"])
                .run(GIT_TIMEOUT)
                .await?
        };
        if staged.success() {
            info!(task = %outcome.task_id, "No changes to commit");
            return Ok(());
        }

        let message = format!("bench: {} {}", status, outcome.task_id);
        self.git(["commit", "-m"])
            .arg(&message)
            .run(GIT_TIMEOUT)
            .await?
            .into_result()?;
        info!("Committed: {}", message);

        if self.push {
            self.git(["push"]).run(PUSH_TIMEOUT).await?.into_result()?;
            info!("Pushed results to remote");
        }
        Ok(())
    }
}

#[async_trait]
impl OutcomeMirror for GitMirror {
    async fn mirror(&self, outcome: &TaskOutcome) {
        let _guard = self.lock.lock().await;
        if let Err(e) = self.commit(outcome).await {
            warn!(task = %outcome.task_id, error = %e, "Git mirror failed");
        }
    }
}
