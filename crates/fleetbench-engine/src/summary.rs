//! End-of-run summary.

use std::path::PathBuf;

use tracing::{error, info};

use fleetbench_core::{TaskId, TaskOutcome};

/// Completed and failed tasks of a run, by identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub manifest: PathBuf,
    pub run_log: PathBuf,
    /// Registry path if VMs are still recorded.
    pub instances: Option<PathBuf>,
}

impl RunSummary {
    /// Summarize outcomes in the order given.
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a TaskOutcome>) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            if outcome.status.is_success() {
                summary.completed.push(outcome.task_id.clone());
            } else {
                summary.failed.push(outcome.task_id.clone());
            }
        }
        summary
    }

    pub fn with_paths(mut self, manifest: PathBuf, run_log: PathBuf, instances: Option<PathBuf>) -> Self {
        self.manifest = manifest;
        self.run_log = run_log;
        self.instances = instances;
        self
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    /// Log the summary through the current subscriber.
    pub fn log(&self) {
        info!(
            completed = self.completed.len(),
            failed = self.failed.len(),
            "Run finished: {}/{} tasks completed",
            self.completed.len(),
            self.total()
        );
        for id in &self.completed {
            info!("  completed: {}", id);
        }
        for id in &self.failed {
            error!("  failed:    {}", id);
        }
        info!("Manifest: {}", self.manifest.display());
        info!("Run log: {}", self.run_log.display());
        if let Some(path) = &self.instances {
            info!(
                "Instances still alive, recorded in {} (run `fleetbench teardown` on the run directory)",
                path.display()
            );
        }
    }
}
