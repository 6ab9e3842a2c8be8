//! Execution engine: one worker per group, bounded concurrency across groups.
//!
//! A group worker acquires one VM, prepares it once, then runs its tasks
//! strictly in order (deploy, benchmark, record, teardown). The VM is
//! released on every path out of the worker, including a panic in the task
//! loop. Task failures never escape the group and group failures never
//! escape `run_all`; only a manifest write failure aborts the run.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, info_span, warn, Instrument};

use fleetbench_core::{BenchmarkTask, ExecutionGroup, Redactor, TaskOutcome};
use fleetbench_provision::{AcquireRequest, VmConnectionInfo, VmLifecycle};
use fleetbench_remote::{RemoteTransport, SshTarget};

use crate::deploy::{DeployPlan, Deployer};
use crate::recorder::ManifestRecorder;
use crate::workload::{extract_results, run_benchmark, Artifact};
use crate::{setup, EngineError, RecorderError};

/// Run-wide knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Model weight cache on the benchmark host.
    pub model_dir: String,
    /// Model hub token passed to containers.
    pub hf_token: String,
    /// Ceiling for one benchmark client invocation.
    pub bench_timeout: Duration,
    pub dry_run: bool,
    /// Keep containers and VMs alive after each task/group.
    pub no_teardown: bool,
    /// Groups in flight at once; `None` runs every group concurrently.
    pub max_concurrent_groups: Option<usize>,
    /// Applied to persisted result artifacts.
    pub redactor: Redactor,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            model_dir: "/hf_models".to_string(),
            hf_token: String::new(),
            bench_timeout: Duration::from_secs(4 * 60 * 60),
            dry_run: false,
            no_teardown: false,
            max_concurrent_groups: None,
            redactor: Redactor::default(),
        }
    }
}

/// Runs execution groups against VMs from a [`VmLifecycle`].
pub struct GroupRunner {
    lifecycle: Arc<VmLifecycle>,
    transport: Arc<dyn RemoteTransport>,
    recorder: Arc<ManifestRecorder>,
    deployer: Deployer,
    settings: EngineSettings,
    aborted: AtomicBool,
}

impl GroupRunner {
    pub fn new(
        lifecycle: Arc<VmLifecycle>,
        transport: Arc<dyn RemoteTransport>,
        recorder: Arc<ManifestRecorder>,
        settings: EngineSettings,
    ) -> Self {
        let deployer = Deployer::new(transport.clone()).with_dry_run(settings.dry_run);
        Self {
            lifecycle,
            transport,
            recorder,
            deployer,
            settings,
            aborted: AtomicBool::new(false),
        }
    }

    /// Replace the deployer (custom step timeouts).
    pub fn with_deployer(mut self, deployer: Deployer) -> Self {
        self.deployer = deployer.with_dry_run(self.settings.dry_run);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Whether a manifest failure has stopped the run.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Run every group, at most `max_concurrent_groups` at a time.
    ///
    /// Results are in group input order, not completion order. A group whose
    /// worker dies unexpectedly has its tasks recorded `failed`; siblings keep
    /// running. Returns an error only if the manifest could not be written.
    pub async fn run_all(
        self: Arc<Self>,
        groups: Vec<ExecutionGroup>,
    ) -> Result<Vec<Vec<TaskOutcome>>, EngineError> {
        let limit = self
            .settings
            .max_concurrent_groups
            .unwrap_or(groups.len())
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        info!(groups = groups.len(), max_concurrent_groups = limit, "Running execution groups");

        let mut handles = Vec::with_capacity(groups.len());
        for group in groups {
            let runner = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let tasks = group.tasks.clone();
            let span = info_span!("group", group = %group.label());

            let handle = tokio::spawn(
                async move {
                    // The semaphore is never closed; a closed one would only lift the bound.
                    let _permit = semaphore.acquire_owned().await.ok();
                    if runner.is_aborted() {
                        warn!("Run aborted; group not started");
                        return Ok(Vec::new());
                    }
                    runner.run_group(&group).await
                }
                .instrument(span)
                .with_current_subscriber(),
            );
            handles.push((tasks, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut fatal: Option<RecorderError> = None;
        for (tasks, handle) in handles {
            match handle.await {
                Ok(Ok(outcomes)) => results.push(outcomes),
                Ok(Err(e)) => {
                    error!(error = %e, "Group stopped by manifest failure");
                    fatal.get_or_insert(e);
                    results.push(Vec::new());
                }
                Err(e) => {
                    error!(error = %e, "Group worker crashed; marking its tasks failed");
                    let mut outcomes = Vec::with_capacity(tasks.len());
                    for task in &tasks {
                        let outcome = TaskOutcome::failed(task);
                        if let Err(e) = self.record(&outcome).await {
                            fatal.get_or_insert(e);
                        }
                        outcomes.push(outcome);
                    }
                    results.push(outcomes);
                }
            }
        }

        match fatal {
            Some(e) => Err(e.into()),
            None => Ok(results),
        }
    }

    /// Run one group to completion on a freshly acquired VM.
    pub async fn run_group(&self, group: &ExecutionGroup) -> Result<Vec<TaskOutcome>, RecorderError> {
        let label = group.label();
        info!(
            gpu = %group.gpu_name,
            gpu_count = group.gpu_count,
            tasks = group.tasks.len(),
            "Starting group"
        );

        let request = AcquireRequest {
            label: label.clone(),
            gpu_name: group.gpu_name.clone(),
            gpu_count: group.gpu_count,
        };
        let conn = match self.lifecycle.acquire(&request).await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "VM provisioning failed; all {} task(s) failed", group.tasks.len());
                return self.fail_remaining(group, Vec::new()).await;
            }
        };
        info!(address = %conn.address(), ssh_port = conn.ssh_port, "VM provisioned");
        let target = conn.ssh_target(self.lifecycle.ssh_key_path());

        let mut outcomes = Vec::with_capacity(group.tasks.len());
        let body = AssertUnwindSafe(self.run_tasks(group, &target, &mut outcomes))
            .catch_unwind()
            .await;

        self.finish_vm(&conn).await;

        match body {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(panic) => {
                error!(panic = %panic_message(panic.as_ref()), "Group worker panicked");
                outcomes = self.fail_remaining(group, outcomes).await?;
            }
        }
        info!(group = %label, "Completed group");
        Ok(outcomes)
    }

    async fn run_tasks(
        &self,
        group: &ExecutionGroup,
        target: &SshTarget,
        outcomes: &mut Vec<TaskOutcome>,
    ) -> Result<(), RecorderError> {
        if let Err(e) = setup::prepare_host(self.transport.as_ref(), target).await {
            warn!(error = %e, "Host setup failed");
        }
        let system_info = setup::collect_system_info(self.transport.as_ref(), target).await;

        for task in &group.tasks {
            if self.is_aborted() {
                warn!("Run aborted; skipping remaining tasks");
                break;
            }
            let span = info_span!("task", task = %task.id());
            let outcome = self
                .attempt(group, task, target, &system_info)
                .instrument(span.clone())
                .await;
            // A recorded outcome is final, even if teardown panics below.
            let recorded = self.record(&outcome).await;
            if recorded.is_ok() {
                outcomes.push(outcome);
            }
            if !self.settings.no_teardown {
                if let Err(e) = self.deployer.teardown(target).instrument(span).await {
                    warn!(task = %task.id(), error = %e, "Task teardown failed");
                }
            }
            recorded?;
        }
        Ok(())
    }

    /// Deploy and benchmark one task. Never fails; failures become outcomes.
    async fn attempt(
        &self,
        group: &ExecutionGroup,
        task: &BenchmarkTask,
        target: &SshTarget,
        system_info: &str,
    ) -> TaskOutcome {
        info!(
            recipe = %task.recipe_dir.display(),
            variant = %task.variant,
            gpu_count = task.gpu_count,
            "Running task"
        );
        let plan = DeployPlan::for_task(
            task,
            group.gpu_count,
            &self.settings.model_dir,
            &self.settings.hf_token,
        );

        info!("Deploying model...");
        if let Err(e) = self.deployer.deploy(target, &plan).await {
            error!(error = %e, "Deploy failed, skipping benchmark");
            return TaskOutcome::failed(task);
        }

        let (command, output) = match run_benchmark(
            self.transport.as_ref(),
            target,
            &task.recipe,
            plan.port,
            self.settings.bench_timeout,
        )
        .await
        {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "Benchmark failed");
                return TaskOutcome::failed(task);
            }
        };

        let path = task.result_path();
        if self.settings.dry_run {
            info!("[dry-run] Would save results to: {}", path.display());
            return TaskOutcome::completed(task);
        }
        let artifact = Artifact {
            task,
            compose: &plan.compose,
            bench_command: &command,
            system_info,
            results: extract_results(&output),
        };
        match artifact.write(&path, &self.settings.redactor) {
            Ok(()) => {
                info!("Results saved to: {}", path.display());
                TaskOutcome::completed(task)
            }
            Err(e) => {
                error!(error = %e, "Failed to save results");
                TaskOutcome::failed(task)
            }
        }
    }

    /// Record `failed` for every task not yet in `outcomes`.
    async fn fail_remaining(
        &self,
        group: &ExecutionGroup,
        mut outcomes: Vec<TaskOutcome>,
    ) -> Result<Vec<TaskOutcome>, RecorderError> {
        for task in group.tasks.iter().skip(outcomes.len()) {
            let outcome = TaskOutcome::failed(task);
            self.record(&outcome).await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn record(&self, outcome: &TaskOutcome) -> Result<(), RecorderError> {
        match self.recorder.record(outcome).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.aborted.store(true, Ordering::SeqCst);
                error!(task = %outcome.task_id, error = %e, "Failed to record outcome; aborting run");
                Err(e)
            }
        }
    }

    /// Delete the group's VM, unless told to keep it.
    async fn finish_vm(&self, conn: &VmConnectionInfo) {
        if self.settings.no_teardown {
            info!(
                address = %conn.address(),
                instance = %conn.handle,
                "Skipping VM deletion (--no-teardown)"
            );
            return;
        }
        info!("Deleting VM...");
        match self.lifecycle.release(conn).await {
            Ok(()) => info!("VM deleted."),
            Err(e) => error!(
                instance = %conn.handle,
                error = %e,
                "Failed to delete VM; manual cleanup required"
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.model_dir, "/hf_models");
        assert_eq!(settings.bench_timeout, Duration::from_secs(14400));
        assert!(settings.max_concurrent_groups.is_none());
    }
}
