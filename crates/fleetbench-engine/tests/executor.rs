//! Group runner behavior against a fake cloud and a fake host.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;

use fleetbench_core::{BenchmarkTask, ExecutionGroup, ProviderKind, Recipe, TaskStatus};
use fleetbench_engine::workload::RESULTS_MARKER;
use fleetbench_engine::{
    teardown_run, Deployer, EngineError, EngineSettings, GroupRunner, ManifestRecorder,
};
use fleetbench_provision::{
    CreateSpec, InstanceHandle, InstanceRecord, InstanceRegistry, PollPolicy, ProviderRegistry,
    ProviderStatus, ProvisionError, SshKeyPair, VmConnectionInfo, VmLifecycle, VmProvider,
};
use fleetbench_remote::{CommandOutput, RemoteTransport, SshTarget, TransportError};

const GPU: &str = "NVIDIA H100 80GB";

#[derive(Default)]
struct FakeCloud {
    creates: AtomicUsize,
    deletes: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    /// Create calls for this GPU count fail.
    fail_create_for: Option<u32>,
    fail_delete: bool,
}

#[async_trait]
impl VmProvider for FakeCloud {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gcp
    }

    fn poll_policy(&self) -> PollPolicy {
        PollPolicy::from_secs(1, 10, 1, 10)
    }

    async fn create(&self, spec: &CreateSpec) -> Result<InstanceHandle, ProvisionError> {
        if self.fail_create_for == Some(spec.gpu_count) {
            return Err(ProvisionError::Api("quota exceeded".into()));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        Ok(InstanceHandle::Gcp {
            instance: spec.name.clone(),
            zone: "us-central1-a".into(),
        })
    }

    async fn poll(&self, _handle: &InstanceHandle) -> Result<ProviderStatus, ProvisionError> {
        Ok(ProviderStatus::Active)
    }

    async fn extract_connection(
        &self,
        handle: &InstanceHandle,
    ) -> Result<VmConnectionInfo, ProvisionError> {
        Ok(VmConnectionInfo {
            host: "10.0.0.7".into(),
            username: "bench".into(),
            ssh_port: 22,
            port_mappings: Vec::new(),
            handle: handle.clone(),
        })
    }

    async fn delete(&self, _handle: &InstanceHandle) -> Result<(), ProvisionError> {
        if self.fail_delete {
            return Err(ProvisionError::Api("delete refused".into()));
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Host with docker already installed that answers every command.
#[derive(Default)]
struct FakeHost {
    commands: Mutex<Vec<String>>,
    /// `docker compose up` calls (1-based) that fail; `usize::MAX` fails all.
    fail_up: Vec<usize>,
    up_calls: AtomicUsize,
    panic_on_bench: bool,
    /// `docker compose down` call (1-based) that panics.
    panic_on_down: Option<usize>,
    down_calls: AtomicUsize,
    delay: Duration,
}

impl FakeHost {
    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn count(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait]
impl RemoteTransport for FakeHost {
    async fn run_command(
        &self,
        _target: &SshTarget,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        self.commands.lock().unwrap().push(command.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if command == "docker compose down" {
            let n = self.down_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_on_down == Some(n) {
                panic!("lost connection during teardown");
            }
        }
        if command.starts_with("docker compose up") {
            let n = self.up_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_up.contains(&n) || self.fail_up.contains(&usize::MAX) {
                return Ok(CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "container exited".into(),
                });
            }
        }
        if command.contains("chat/completions") {
            return Ok(CommandOutput {
                exit_code: 0,
                stdout: r#"{"choices":[{"message":{"content":"4"}}]}"#.into(),
                stderr: String::new(),
            });
        }
        if command.contains("vllm bench serve") {
            if self.panic_on_bench {
                panic!("benchmark client crashed");
            }
            return Ok(CommandOutput {
                exit_code: 0,
                stdout: format!("warmup\n{}\nSuccessful requests: 80\n", RESULTS_MARKER),
                stderr: String::new(),
            });
        }
        Ok(CommandOutput::ok())
    }

    async fn write_file(
        &self,
        _target: &SshTarget,
        path: &str,
        _content: &str,
    ) -> Result<(), TransportError> {
        self.commands.lock().unwrap().push(format!("write {}", path));
        Ok(())
    }

    async fn probe(&self, _target: &SshTarget) -> bool {
        true
    }
}

fn task(index: usize, variant: &str, gpu_count: u32, run_dir: &Path) -> BenchmarkTask {
    let mut recipe = Recipe::default();
    recipe.model.huggingface = "Qwen/Qwen3-8B".into();
    BenchmarkTask::new(index, "recipes/qwen3-8b", variant, recipe, GPU, gpu_count, run_dir)
}

fn group(tasks: Vec<BenchmarkTask>) -> ExecutionGroup {
    let gpu_count = tasks.iter().map(|t| t.gpu_count).max().unwrap_or(1);
    ExecutionGroup {
        gpu_name: GPU.into(),
        gpu_count,
        tasks,
        split_index: None,
    }
}

struct Harness {
    cloud: Arc<FakeCloud>,
    host: Arc<FakeHost>,
    recorder: Arc<ManifestRecorder>,
    runner: Arc<GroupRunner>,
    registry: InstanceRegistry,
}

fn harness(run_dir: &Path, cloud: FakeCloud, host: FakeHost, settings: EngineSettings) -> Harness {
    harness_with_recorder(run_dir, cloud, host, settings, ManifestRecorder::open(run_dir))
}

fn harness_with_recorder(
    run_dir: &Path,
    cloud: FakeCloud,
    host: FakeHost,
    settings: EngineSettings,
    recorder: ManifestRecorder,
) -> Harness {
    let cloud = Arc::new(cloud);
    let host = Arc::new(host);
    let registry = InstanceRegistry::for_run_dir(run_dir);
    let key = SshKeyPair {
        private_key: run_dir.join("id_test"),
        public_key: "ssh-ed25519 AAAA test".into(),
    };
    let lifecycle = VmLifecycle::new(
        ProviderRegistry::new().with_provider(cloud.clone()),
        host.clone(),
        key,
    )
    .with_registry(registry.clone())
    .with_dry_run(settings.dry_run);
    let recorder = Arc::new(recorder);
    let runner = Arc::new(GroupRunner::new(
        Arc::new(lifecycle),
        host.clone(),
        recorder.clone(),
        settings,
    ));
    Harness {
        cloud,
        host,
        recorder,
        runner,
        registry,
    }
}

/// Deploy/benchmark stage a host command belongs to, if any.
fn stage(command: &str) -> Option<&'static str> {
    if command == "write docker-compose.yaml" {
        Some("write")
    } else if command == "docker compose pull" {
        Some("pull")
    } else if command.contains("huggingface-cli download") {
        Some("download")
    } else if command == "docker compose down" {
        Some("down")
    } else if command.starts_with("docker compose up") {
        Some("up")
    } else if command.contains("/health") {
        Some("health")
    } else if command.contains("chat/completions") {
        Some("smoke")
    } else if command.contains("vllm bench serve") {
        Some("bench")
    } else {
        None
    }
}

fn statuses(outcomes: &[fleetbench_core::TaskOutcome]) -> Vec<TaskStatus> {
    outcomes.iter().map(|o| o.status).collect()
}

#[tokio::test(start_paused = true)]
async fn test_group_runs_every_task_on_one_vm() {
    let dir = tempdir().unwrap();
    let tasks = vec![task(0, "h100x1_mc8", 1, dir.path()), task(1, "h100x1_mc16", 1, dir.path())];
    let h = harness(dir.path(), FakeCloud::default(), FakeHost::default(), EngineSettings::default());

    let results = h.runner.clone().run_all(vec![group(tasks.clone())]).await.unwrap();

    assert_eq!(statuses(&results[0]), vec![TaskStatus::Completed, TaskStatus::Completed]);
    assert_eq!(h.cloud.creates.load(Ordering::SeqCst), 1);
    assert_eq!(h.cloud.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(h.host.count("command -v docker"), 1);
    assert_eq!(h.host.count("vllm bench serve"), 2);

    let text = std::fs::read_to_string(tasks[0].result_path()).unwrap();
    assert!(text.contains("=== BENCHMARK RESULTS ===\n============ Serving Benchmark Result"));
    assert!(tasks[1].result_path().exists());

    // Deleted VMs leave the registry.
    assert!(h.registry.load().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_acquire_failure_fails_group_without_commands() {
    let dir = tempdir().unwrap();
    let cloud = FakeCloud {
        fail_create_for: Some(2),
        ..Default::default()
    };
    let h = harness(dir.path(), cloud, FakeHost::default(), EngineSettings::default());
    let tasks = vec![task(0, "h100x2_a", 2, dir.path()), task(1, "h100x2_b", 2, dir.path())];

    let results = h.runner.clone().run_all(vec![group(tasks)]).await.unwrap();

    assert_eq!(statuses(&results[0]), vec![TaskStatus::Failed, TaskStatus::Failed]);
    assert!(h.host.commands().is_empty());
    assert_eq!(h.cloud.deletes.load(Ordering::SeqCst), 0);
    let manifest = h.recorder.load().unwrap();
    assert_eq!(manifest.tasks.len(), 2);
    assert!(manifest.tasks.iter().all(|t| t.status == TaskStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_deploy_failure_moves_to_next_task() {
    let dir = tempdir().unwrap();
    let host = FakeHost {
        fail_up: vec![1],
        ..Default::default()
    };
    let h = harness(dir.path(), FakeCloud::default(), host, EngineSettings::default());
    let tasks = vec![
        task(0, "h100x1_a", 1, dir.path()),
        task(1, "h100x1_b", 1, dir.path()),
        task(2, "h100x1_c", 1, dir.path()),
    ];

    let results = h.runner.clone().run_all(vec![group(tasks.clone())]).await.unwrap();

    assert_eq!(
        statuses(&results[0]),
        vec![TaskStatus::Failed, TaskStatus::Completed, TaskStatus::Completed]
    );
    assert_eq!(h.host.count("docker compose pull"), 3);
    assert_eq!(h.host.count("vllm bench serve"), 2);
    assert!(!tasks[0].result_path().exists());
    assert!(tasks[2].result_path().exists());
    assert_eq!(h.cloud.creates.load(Ordering::SeqCst), 1);
    assert_eq!(h.cloud.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_vm_deleted_once_when_every_task_fails() {
    let dir = tempdir().unwrap();
    let host = FakeHost {
        fail_up: vec![usize::MAX],
        ..Default::default()
    };
    let h = harness(dir.path(), FakeCloud::default(), host, EngineSettings::default());
    let tasks = vec![task(0, "h100x1_a", 1, dir.path()), task(1, "h100x1_b", 1, dir.path())];

    let results = h.runner.clone().run_all(vec![group(tasks)]).await.unwrap();

    assert_eq!(statuses(&results[0]), vec![TaskStatus::Failed, TaskStatus::Failed]);
    assert_eq!(h.cloud.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_panic_in_task_loop_still_deletes_vm() {
    let dir = tempdir().unwrap();
    let host = FakeHost {
        panic_on_bench: true,
        ..Default::default()
    };
    let h = harness(dir.path(), FakeCloud::default(), host, EngineSettings::default());
    let tasks = vec![task(0, "h100x1_a", 1, dir.path()), task(1, "h100x1_b", 1, dir.path())];

    let results = h.runner.clone().run_all(vec![group(tasks)]).await.unwrap();

    assert_eq!(statuses(&results[0]), vec![TaskStatus::Failed, TaskStatus::Failed]);
    assert_eq!(h.cloud.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(h.recorder.load().unwrap().tasks.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_groups_bounded() {
    let dir = tempdir().unwrap();
    let host = FakeHost {
        delay: Duration::from_secs(5),
        ..Default::default()
    };
    let settings = EngineSettings {
        max_concurrent_groups: Some(2),
        ..Default::default()
    };
    let h = harness(dir.path(), FakeCloud::default(), host, settings);
    let groups: Vec<_> = (0..5)
        .map(|i| group(vec![task(i, &format!("h100x1_v{}", i), 1, dir.path())]))
        .collect();

    let results = h.runner.clone().run_all(groups).await.unwrap();

    assert_eq!(results.len(), 5);
    assert_eq!(h.cloud.creates.load(Ordering::SeqCst), 5);
    assert_eq!(h.cloud.deletes.load(Ordering::SeqCst), 5);
    let peak = h.cloud.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak active VMs {}", peak);
    assert_eq!(peak, 2);
}

#[tokio::test(start_paused = true)]
async fn test_manifest_follows_submission_order() {
    let dir = tempdir().unwrap();
    // Group B fails at acquisition and finishes long before group A.
    let cloud = FakeCloud {
        fail_create_for: Some(2),
        ..Default::default()
    };
    let host = FakeHost {
        delay: Duration::from_secs(1),
        ..Default::default()
    };
    let h = harness(dir.path(), cloud, host, EngineSettings::default());
    let a = group(vec![task(0, "h100x1_a", 1, dir.path())]);
    let b = group(vec![task(1, "h100x2_b", 2, dir.path())]);

    let results = h.runner.clone().run_all(vec![a, b]).await.unwrap();

    assert_eq!(results[0][0].status, TaskStatus::Completed);
    assert_eq!(results[1][0].status, TaskStatus::Failed);
    let manifest = h.recorder.load().unwrap();
    let ids: Vec<_> = manifest.tasks.iter().map(|t| t.task_id.to_string()).collect();
    assert_eq!(ids, vec!["qwen3-8b/h100x1_a", "qwen3-8b/h100x2_b"]);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_creates_nothing() {
    let dir = tempdir().unwrap();
    let settings = EngineSettings {
        dry_run: true,
        ..Default::default()
    };
    let h = harness(dir.path(), FakeCloud::default(), FakeHost::default(), settings);
    let tasks = vec![task(0, "h100x1_a", 1, dir.path())];

    let results = h.runner.clone().run_all(vec![group(tasks.clone())]).await.unwrap();

    assert_eq!(statuses(&results[0]), vec![TaskStatus::Completed]);
    assert_eq!(h.cloud.creates.load(Ordering::SeqCst), 0);
    assert_eq!(h.cloud.deletes.load(Ordering::SeqCst), 0);
    assert_eq!(h.host.count("chat/completions"), 0);
    assert!(!tasks[0].result_path().exists());
    assert_eq!(h.recorder.load().unwrap().tasks.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_issues_same_intents_as_real_run() {
    let real_dir = tempdir().unwrap();
    let real = harness(real_dir.path(), FakeCloud::default(), FakeHost::default(), EngineSettings::default());
    real.runner
        .clone()
        .run_all(vec![group(vec![task(0, "h100x1_a", 1, real_dir.path())])])
        .await
        .unwrap();

    let dry_dir = tempdir().unwrap();
    let settings = EngineSettings {
        dry_run: true,
        ..Default::default()
    };
    let dry = harness(dry_dir.path(), FakeCloud::default(), FakeHost::default(), settings);
    dry.runner
        .clone()
        .run_all(vec![group(vec![task(0, "h100x1_a", 1, dry_dir.path())])])
        .await
        .unwrap();

    // Only the smoke test needs a live model.
    let real_commands: Vec<String> = real
        .host
        .commands()
        .into_iter()
        .filter(|c| stage(c) != Some("smoke"))
        .collect();
    assert_eq!(dry.host.commands(), real_commands);

    let stages: Vec<_> = dry.host.commands().iter().filter_map(|c| stage(c)).collect();
    assert_eq!(
        stages,
        vec!["write", "pull", "download", "down", "up", "health", "bench", "down"]
    );

    assert_eq!(real.cloud.creates.load(Ordering::SeqCst), 1);
    assert_eq!(real.cloud.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(dry.cloud.creates.load(Ordering::SeqCst), 0);
    assert_eq!(dry.cloud.deletes.load(Ordering::SeqCst), 0);
}

#[cfg(unix)]
#[tokio::test(start_paused = true)]
async fn test_dry_run_mirror_never_runs_git() {
    use fleetbench_engine::GitMirror;
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    let git_dir = tempdir().unwrap();
    let log = git_dir.path().join("git.log");
    let git = git_dir.path().join("git");
    std::fs::write(&git, format!("#!/bin/sh\necho \"$@\" >> {}\nexit 0\n", log.display())).unwrap();
    std::fs::set_permissions(&git, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mirror = GitMirror::new("/repo", dir.path())
        .with_dry_run(true)
        .with_git_program(git.display().to_string());
    let recorder = ManifestRecorder::open(dir.path()).with_mirror(Arc::new(mirror));
    let settings = EngineSettings {
        dry_run: true,
        ..Default::default()
    };
    let h = harness_with_recorder(dir.path(), FakeCloud::default(), FakeHost::default(), settings, recorder);

    h.runner
        .clone()
        .run_all(vec![group(vec![task(0, "h100x1_a", 1, dir.path())])])
        .await
        .unwrap();

    assert_eq!(h.recorder.load().unwrap().tasks.len(), 1);
    assert!(!log.exists());
}

#[tokio::test(start_paused = true)]
async fn test_panic_after_record_keeps_summary_and_manifest_in_step() {
    let dir = tempdir().unwrap();
    // Call 1 is the first task's pre-deploy cleanup, call 2 its teardown.
    let host = FakeHost {
        panic_on_down: Some(2),
        ..Default::default()
    };
    let h = harness(dir.path(), FakeCloud::default(), host, EngineSettings::default());
    let tasks = vec![task(0, "h100x1_a", 1, dir.path()), task(1, "h100x1_b", 1, dir.path())];

    let results = h.runner.clone().run_all(vec![group(tasks)]).await.unwrap();

    assert_eq!(statuses(&results[0]), vec![TaskStatus::Completed, TaskStatus::Failed]);
    let manifest = h.recorder.load().unwrap();
    assert_eq!(statuses(&manifest.tasks), statuses(&results[0]));
    assert_eq!(h.cloud.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_teardown_keeps_vm_and_containers() {
    let dir = tempdir().unwrap();
    let settings = EngineSettings {
        no_teardown: true,
        ..Default::default()
    };
    let h = harness(dir.path(), FakeCloud::default(), FakeHost::default(), settings);
    let tasks = vec![task(0, "h100x1_a", 1, dir.path())];

    h.runner.clone().run_all(vec![group(tasks)]).await.unwrap();

    assert_eq!(h.cloud.deletes.load(Ordering::SeqCst), 0);
    // Only the pre-deploy cleanup stops containers.
    assert_eq!(h.host.count("docker compose down"), 1);
    let records = h.registry.load().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].host.as_deref(), Some("10.0.0.7"));
}

#[tokio::test(start_paused = true)]
async fn test_manifest_failure_aborts_run() {
    let dir = tempdir().unwrap();
    // A directory where the manifest file should be makes every write fail.
    std::fs::create_dir(dir.path().join("manifest.json")).unwrap();
    let h = harness(dir.path(), FakeCloud::default(), FakeHost::default(), EngineSettings::default());
    let tasks = vec![task(0, "h100x1_a", 1, dir.path()), task(1, "h100x1_b", 1, dir.path())];

    let err = h.runner.clone().run_all(vec![group(tasks)]).await.unwrap_err();

    assert!(matches!(err, EngineError::Recorder(_)));
    assert!(h.runner.is_aborted());
    assert_eq!(h.host.count("vllm bench serve"), 1);
    assert_eq!(h.cloud.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_teardown_run_deletes_registered_instances() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), FakeCloud::default(), FakeHost::default(), EngineSettings::default());

    let first = InstanceHandle::Gcp {
        instance: "bench-h100x1-aaaa".into(),
        zone: "us-central1-a".into(),
    };
    let second = InstanceHandle::Gcp {
        instance: "bench-h100x1-bbbb".into(),
        zone: "us-central1-a".into(),
    };
    h.registry
        .register(InstanceRecord::new(first.clone(), "h100x1", GPU, 1))
        .unwrap();
    h.registry
        .record_connection(&VmConnectionInfo {
            host: "10.0.0.7".into(),
            username: "bench".into(),
            ssh_port: 22,
            port_mappings: Vec::new(),
            handle: first.clone(),
        })
        .unwrap();
    h.registry
        .register(InstanceRecord::new(second.clone(), "h100x1", GPU, 1))
        .unwrap();

    let lifecycle = VmLifecycle::new(
        ProviderRegistry::new().with_provider(h.cloud.clone()),
        h.host.clone(),
        SshKeyPair {
            private_key: dir.path().join("id_test"),
            public_key: String::new(),
        },
    )
    .with_registry(h.registry.clone());
    let deployer = Deployer::new(h.host.clone());

    let report = teardown_run(&h.registry, &lifecycle, &deployer).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.deleted, vec![first, second]);
    assert_eq!(h.host.count("docker compose down"), 1);
    assert!(h.registry.load().unwrap().is_empty());
}

#[tokio::test]
async fn test_teardown_run_keeps_failed_deletions() {
    let dir = tempdir().unwrap();
    let cloud = FakeCloud {
        fail_delete: true,
        ..Default::default()
    };
    let h = harness(dir.path(), cloud, FakeHost::default(), EngineSettings::default());
    let handle = InstanceHandle::Gcp {
        instance: "bench-h100x1-cccc".into(),
        zone: "us-central1-a".into(),
    };
    h.registry
        .register(InstanceRecord::new(handle.clone(), "h100x1", GPU, 1))
        .unwrap();

    let lifecycle = VmLifecycle::new(
        ProviderRegistry::new().with_provider(h.cloud.clone()),
        h.host.clone(),
        SshKeyPair {
            private_key: dir.path().join("id_test"),
            public_key: String::new(),
        },
    )
    .with_registry(h.registry.clone());

    let report = teardown_run(&h.registry, &lifecycle, &Deployer::new(h.host.clone()))
        .await
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.failed, vec![handle]);
    // No address recorded, so no container shutdown was attempted.
    assert!(h.host.commands().is_empty());
    assert_eq!(h.registry.load().unwrap().len(), 1);
}
