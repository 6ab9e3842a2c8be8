//! FleetBench CLI - benchmark LLM serving recipes on cloud GPU VMs.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, warn};

use fleetbench_core::{GroupByModelAndGpu, Planner, ProviderKind, Redactor};
use fleetbench_engine::logging::console_dispatch;
use fleetbench_engine::{
    teardown_run, BenchConfig, ConfigError, DeployError, Deployer, EngineError, EngineSettings,
    GitMirror, GroupRunner, Manifest, ManifestRecorder, ProvidersConfig, RunDir, RunLog,
    RunSummary,
};
use fleetbench_provision::{
    CloudRiftProvider, GcpProvider, InstanceRegistry, ProviderRegistry, ProvisionError,
    SshKeyPair, VmLifecycle,
};
use fleetbench_remote::{RemoteTransport, SshTransport};

mod deploy;
mod recipes;
mod vm;

use recipes::{RecipeError, RECIPE_FILE};

const CLOUDRIFT_API_KEY: &str = "CLOUDRIFT_API_KEY";
const HF_TOKEN_VARS: &[&str] = &["HF_TOKEN", "HUGGING_FACE_HUB_TOKEN"];

/// FleetBench - LLM serving benchmarks on cloud GPU VMs
#[derive(Parser)]
#[command(name = "fleetbench")]
#[command(about = "Benchmark LLM serving recipes on cloud GPU VMs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy, benchmark and tear down recipes on cloud VMs
    Bench(BenchArgs),

    /// Delete VMs left behind by a run (--no-teardown or a crash)
    Teardown {
        /// Run directory containing instances.json
        run_dir: PathBuf,

        /// SSH private key used to stop containers before deletion
        #[arg(long, default_value = "~/.ssh/id_ed25519")]
        ssh_key: String,

        /// Configuration file (provider settings)
        #[arg(long, default_value = "fleetbench.toml")]
        config: PathBuf,
    },

    /// Deploy one recipe without benchmarking it
    Deploy {
        #[command(subcommand)]
        target: deploy::DeployTarget,
    },

    /// Create or delete a single cloud VM
    Vm {
        #[command(subcommand)]
        action: vm::VmAction,
    },
}

#[derive(Args)]
struct BenchArgs {
    /// Recipe directories to benchmark
    #[arg(required = true)]
    recipes: Vec<PathBuf>,

    /// Configuration file
    #[arg(long, default_value = "fleetbench.toml")]
    config: PathBuf,

    /// SSH private key; `{key}.pub` is installed on every VM
    #[arg(long, default_value = "~/.ssh/id_ed25519")]
    ssh_key: String,

    /// Log provider calls and remote commands instead of running them
    #[arg(long)]
    dry_run: bool,

    /// Maximum execution groups in flight (default: all of them)
    #[arg(long)]
    max_workers: Option<usize>,

    /// Keep containers and VMs alive; clean up later with `teardown`
    #[arg(long)]
    no_teardown: bool,

    /// Commit each result to the enclosing git repository
    #[arg(long)]
    git_mirror: bool,

    /// Split each (model, GPU) group across up to this many VMs
    #[arg(long, default_value_t = 1)]
    gpu_concurrency: usize,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("No benchmark tasks found in the given recipe directories")]
    NoTasks,

    #[error("Recipe {0} has no 'deploy.gpu' field; cloud deploys need one")]
    MissingGpu(PathBuf),

    /// Deploy failed on a standalone host.
    #[error(transparent)]
    Deploy(#[from] DeployError),

    /// Provider call failed after validation.
    #[error(transparent)]
    Cloud(ProvisionError),
}

impl CliError {
    /// 2 for problems found before any VM is touched, 1 otherwise.
    fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Recipe(_) | Self::NoTasks | Self::MissingGpu(_) => 2,
            Self::Provision(_) => 2,
            Self::Engine(EngineError::Config(_)) => 2,
            Self::Engine(_) | Self::Deploy(_) | Self::Cloud(_) => 1,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let redactor = Redactor::from_env();
    let console = console_dispatch(redactor.clone());

    let result = match cli.command {
        Commands::Bench(args) => bench(args, redactor).with_subscriber(console.clone()).await,
        Commands::Teardown {
            run_dir,
            ssh_key,
            config,
        } => teardown(run_dir, ssh_key, config)
            .with_subscriber(console.clone())
            .await,
        Commands::Deploy { target } => deploy::run(target).with_subscriber(console.clone()).await,
        Commands::Vm { action } => vm::run(action).with_subscriber(console.clone()).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::dispatcher::with_default(&console, || error!("Error: {}", e));
            ExitCode::from(e.exit_code())
        }
    }
}

async fn bench(args: BenchArgs, redactor: Redactor) -> Result<ExitCode, CliError> {
    let mut config = BenchConfig::load(&args.config)?;
    if args.git_mirror {
        config.mirror.enabled = true;
    }
    let dry_run = args.dry_run;

    let variants = recipes::enumerate(&args.recipes)?;
    if variants.is_empty() {
        return Err(CliError::NoTasks);
    }

    // Every GPU must map to a registered provider before anything is created.
    let providers = build_providers(&config.providers, dry_run)?;
    for variant in &variants {
        check_provider(&providers, &variant.gpu_name, variant.gpu_count)?;
    }

    let ssh_key = SshKeyPair::load(expand_home(&args.ssh_key), dry_run)?;
    let run_dir = RunDir::create(config.results_dir()?)?;
    let run_log = RunLog::open(&run_dir.log_path(), redactor.clone(), true)?;
    let dispatch = run_log.dispatch().clone();

    async move {
        info!(run_dir = %run_dir.path.display(), "Run directory: {}", run_dir.path.display());
        copy_recipe_files(&args.recipes, &run_dir.path);

        let tasks: Vec<_> = variants
            .into_iter()
            .enumerate()
            .map(|(index, variant)| variant.into_task(index, &run_dir.path))
            .collect();
        let mut recipe_names: Vec<String> = Vec::new();
        for task in &tasks {
            if !recipe_names.contains(&task.recipe_name) {
                recipe_names.push(task.recipe_name.clone());
            }
        }
        let task_count = tasks.len();
        let groups = GroupByModelAndGpu::new()
            .with_gpu_concurrency(args.gpu_concurrency)
            .plan(tasks);
        info!(
            tasks = task_count,
            groups = groups.len(),
            max_workers = args.max_workers.unwrap_or(groups.len()),
            "Running {} benchmark task(s) in {} execution group(s)",
            task_count,
            groups.len()
        );

        let header = Manifest {
            timestamp: run_dir.started_at.to_rfc3339(),
            code_hash: run_dir.code_hash.clone(),
            recipes: recipe_names,
            tasks: Vec::new(),
        };
        let mut recorder = ManifestRecorder::create(&run_dir.path, header).map_err(EngineError::from)?;
        if config.mirror.enabled {
            let mirror = GitMirror::new(".", &run_dir.path)
                .with_push(config.mirror.push)
                .with_dry_run(dry_run);
            recorder = recorder.with_mirror(Arc::new(mirror));
        }

        let transport: Arc<dyn RemoteTransport> = Arc::new(SshTransport::new().with_dry_run(dry_run));
        let registry = InstanceRegistry::for_run_dir(&run_dir.path);
        let lifecycle = VmLifecycle::new(providers, transport.clone(), ssh_key)
            .with_registry(registry.clone())
            .with_dry_run(dry_run);

        let settings = EngineSettings {
            model_dir: config.benchmark.model_dir.clone(),
            hf_token: hf_token(),
            bench_timeout: Duration::from_secs(config.benchmark.bench_timeout_secs),
            dry_run,
            no_teardown: args.no_teardown,
            max_concurrent_groups: args.max_workers,
            redactor,
        };
        let runner = Arc::new(GroupRunner::new(
            Arc::new(lifecycle),
            transport,
            Arc::new(recorder),
            settings,
        ));
        let results = runner.run_all(groups).await?;

        let leftover = match registry.load() {
            Ok(records) if !records.is_empty() => Some(registry.path().to_path_buf()),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read instance registry");
                None
            }
        };
        let summary = RunSummary::from_outcomes(results.iter().flatten()).with_paths(
            run_dir.manifest_path(),
            run_log.path().to_path_buf(),
            leftover,
        );
        summary.log();

        let code = if summary.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        };
        Ok::<_, CliError>(code)
    }
    .with_subscriber(dispatch)
    .await
}

async fn teardown(run_dir: PathBuf, ssh_key: String, config: PathBuf) -> Result<ExitCode, CliError> {
    let providers_config = load_providers(&config)?;

    let registry = InstanceRegistry::for_run_dir(&run_dir);
    let records = registry.load()?;
    if records.is_empty() {
        info!("No instances recorded in {}", registry.path().display());
        return Ok(ExitCode::SUCCESS);
    }

    let providers = build_providers(&providers_config, false)?;
    if records
        .iter()
        .any(|r| r.handle.provider() == ProviderKind::CloudRift)
        && providers.get(ProviderKind::CloudRift).is_err()
    {
        return Err(ProvisionError::MissingCredential(CLOUDRIFT_API_KEY).into());
    }

    // Only the private key path is needed to reach recorded hosts.
    let key = SshKeyPair::load(expand_home(&ssh_key), true)?;
    let transport: Arc<dyn RemoteTransport> = Arc::new(SshTransport::new());
    let lifecycle = VmLifecycle::new(providers, transport.clone(), key).with_registry(registry.clone());
    let deployer = Deployer::new(transport);

    let report = teardown_run(&registry, &lifecycle, &deployer).await?;
    info!(
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        "Teardown finished"
    );
    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!(
            "{} instance(s) could not be deleted; they remain in {}",
            report.failed.len(),
            registry.path().display()
        );
        Ok(ExitCode::from(1))
    }
}

/// Provider settings from `config`, or defaults when the file is absent.
fn load_providers(config: &Path) -> Result<ProvidersConfig, CliError> {
    if config.exists() {
        Ok(BenchConfig::load(config)?.providers)
    } else {
        info!(config = %config.display(), "No config file; using default provider settings");
        Ok(ProvidersConfig::default())
    }
}

/// GCP is always available; CloudRift needs `CLOUDRIFT_API_KEY` unless dry-run.
fn build_providers(config: &ProvidersConfig, dry_run: bool) -> Result<ProviderRegistry, CliError> {
    let mut providers =
        ProviderRegistry::new().with_provider(Arc::new(GcpProvider::new(config.gcp.clone())));
    let api_key = std::env::var(CLOUDRIFT_API_KEY)
        .ok()
        .filter(|k| !k.is_empty())
        .or_else(|| dry_run.then(|| "dry-run".to_string()));
    if let Some(api_key) = api_key {
        let cloudrift = CloudRiftProvider::new(api_key, config.cloudrift.clone())?;
        providers = providers.with_provider(Arc::new(cloudrift));
    }
    Ok(providers)
}

fn check_provider(providers: &ProviderRegistry, gpu_name: &str, gpu_count: u32) -> Result<(), CliError> {
    match providers.resolve(gpu_name, gpu_count) {
        Ok(_) => Ok(()),
        Err(ProvisionError::NoProvider(ProviderKind::CloudRift)) => {
            Err(ProvisionError::MissingCredential(CLOUDRIFT_API_KEY).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn hf_token() -> String {
    HF_TOKEN_VARS
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|v| !v.is_empty())
        .unwrap_or_default()
}

/// Snapshot each recipe file into `{run_dir}/{recipe_name}/`.
fn copy_recipe_files(recipe_dirs: &[PathBuf], run_dir: &Path) {
    for dir in recipe_dirs {
        let src = dir.join(RECIPE_FILE);
        let Some(name) = dir.file_name() else {
            continue;
        };
        if !src.is_file() {
            continue;
        }
        let dest_dir = run_dir.join(name);
        let dest = dest_dir.join(RECIPE_FILE);
        if dest.exists() {
            continue;
        }
        if let Err(e) = std::fs::create_dir_all(&dest_dir).and_then(|_| std::fs::copy(&src, &dest)) {
            warn!(recipe = %src.display(), error = %e, "Failed to copy recipe into run directory");
        }
    }
}

/// Expand a leading `~/` using `$HOME`.
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) if !home.is_empty() => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_bench() {
        let cli = Cli::try_parse_from([
            "fleetbench",
            "bench",
            "recipes/a",
            "recipes/b",
            "--dry-run",
            "--max-workers",
            "3",
            "--no-teardown",
        ])
        .unwrap();
        let Commands::Bench(args) = cli.command else {
            panic!("expected bench");
        };
        assert_eq!(args.recipes, vec![PathBuf::from("recipes/a"), PathBuf::from("recipes/b")]);
        assert!(args.dry_run);
        assert!(args.no_teardown);
        assert_eq!(args.max_workers, Some(3));
        assert_eq!(args.config, PathBuf::from("fleetbench.toml"));
        assert_eq!(args.gpu_concurrency, 1);
    }

    #[test]
    fn test_bench_requires_recipes() {
        assert!(Cli::try_parse_from(["fleetbench", "bench"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::NoTasks.exit_code(), 2);
        assert_eq!(
            CliError::from(ProvisionError::MissingCredential(CLOUDRIFT_API_KEY)).exit_code(),
            2
        );
        assert_eq!(
            CliError::from(EngineError::from(ConfigError::Missing("benchmark.local_results_dir")))
                .exit_code(),
            2
        );
        assert_eq!(
            CliError::from(EngineError::from(fleetbench_engine::RecorderError::Poisoned)).exit_code(),
            1
        );
        assert_eq!(CliError::MissingGpu(PathBuf::from("r")).exit_code(), 2);
        assert_eq!(CliError::Cloud(ProvisionError::Api("quota".into())).exit_code(), 1);
    }

    #[test]
    fn test_unknown_gpu_is_rejected_up_front() {
        let providers = build_providers(&ProvidersConfig::default(), true).unwrap();
        assert!(check_provider(&providers, "NVIDIA H100 80GB", 8).is_ok());
        assert!(check_provider(&providers, "NVIDIA L40S", 1).is_ok());
        let err = check_provider(&providers, "Voodoo 3", 1).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/key"), PathBuf::from("/abs/key"));
        if let Ok(home) = std::env::var("HOME") {
            if !home.is_empty() {
                assert_eq!(expand_home("~/.ssh/id"), Path::new(&home).join(".ssh/id"));
            }
        }
    }
}
