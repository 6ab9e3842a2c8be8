//! `deploy local|ssh|cloud`: bring one recipe up without benchmarking it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Subcommand};
use tracing::{info, warn};

use fleetbench_engine::{setup, DeployPlan, Deployer};
use fleetbench_provision::{AcquireRequest, SshKeyPair, VmLifecycle};
use fleetbench_remote::{LocalTransport, RemoteTransport, SshTarget, SshTransport};

use crate::recipes::{self, RecipeError};
use crate::{build_providers, check_provider, expand_home, hf_token, load_providers, CliError};

#[derive(Subcommand)]
pub enum DeployTarget {
    /// Deploy on this machine with docker compose
    Local(LocalArgs),

    /// Deploy to an existing server over SSH
    Ssh(SshArgs),

    /// Provision a VM for the recipe's GPU and deploy to it
    Cloud(CloudArgs),
}

#[derive(Args)]
pub struct RecipeArgs {
    /// Recipe directory
    #[arg(long)]
    recipe: PathBuf,

    /// Model hub token (default: $HF_TOKEN)
    #[arg(long)]
    hf_token: Option<String>,

    /// Print commands without executing
    #[arg(long)]
    dry_run: bool,
}

impl RecipeArgs {
    fn hf_token(&self) -> String {
        self.hf_token.clone().unwrap_or_else(hf_token)
    }
}

#[derive(Args)]
pub struct LocalArgs {
    #[command(flatten)]
    common: RecipeArgs,

    /// Model cache directory
    #[arg(long, default_value = "/mnt/models")]
    model_dir: String,

    /// Stop containers instead of deploying
    #[arg(long)]
    teardown: bool,
}

#[derive(Args)]
pub struct SshArgs {
    #[command(flatten)]
    common: RecipeArgs,

    /// SSH address (user@host)
    #[arg(long)]
    server: String,

    /// SSH private key
    #[arg(long, default_value = "~/.ssh/id_ed25519")]
    ssh_key: String,

    #[arg(long, default_value_t = 22)]
    ssh_port: u16,

    /// Model cache directory
    #[arg(long, default_value = "/mnt/models")]
    model_dir: String,

    /// Stop containers instead of deploying
    #[arg(long)]
    teardown: bool,
}

#[derive(Args)]
pub struct CloudArgs {
    #[command(flatten)]
    common: RecipeArgs,

    /// VM name prefix
    #[arg(long, default_value = "cloud-deploy")]
    name: String,

    /// SSH private key; `{key}.pub` is installed on the VM
    #[arg(long, default_value = "~/.ssh/id_ed25519")]
    ssh_key: String,

    /// Model cache directory
    #[arg(long, default_value = "/hf_models")]
    model_dir: String,

    /// Configuration file (provider settings)
    #[arg(long, default_value = "fleetbench.toml")]
    config: PathBuf,
}

pub async fn run(target: DeployTarget) -> Result<ExitCode, CliError> {
    match target {
        DeployTarget::Local(args) => local(args).await,
        DeployTarget::Ssh(args) => ssh(args).await,
        DeployTarget::Cloud(args) => cloud(args).await,
    }
}

async fn local(args: LocalArgs) -> Result<ExitCode, CliError> {
    let dir = std::fs::canonicalize(&args.common.recipe)
        .map_err(|e| RecipeError::Io(args.common.recipe.clone(), e))?;
    let transport: Arc<dyn RemoteTransport> =
        Arc::new(LocalTransport::new(&dir).with_dry_run(args.common.dry_run));
    let deployer = Deployer::new(transport).with_dry_run(args.common.dry_run);
    let target = SshTarget::new("localhost", "", 22, PathBuf::new());

    if args.teardown {
        deployer.teardown(&target).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let recipe = recipes::load_recipe(&dir)?;
    let plan = DeployPlan::for_recipe(&recipe, &args.model_dir, &args.common.hf_token());
    deployer.deploy(&target, &plan).await?;
    Ok(ExitCode::SUCCESS)
}

async fn ssh(args: SshArgs) -> Result<ExitCode, CliError> {
    let (username, host) = split_server(&args.server);
    let target = SshTarget::new(host, username, args.ssh_port, expand_home(&args.ssh_key));
    let transport: Arc<dyn RemoteTransport> =
        Arc::new(SshTransport::new().with_dry_run(args.common.dry_run));
    let deployer = Deployer::new(transport.clone()).with_dry_run(args.common.dry_run);

    if args.teardown {
        deployer.teardown(&target).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let recipe = recipes::load_recipe(&args.common.recipe)?;
    if let Err(e) = setup::prepare_host(transport.as_ref(), &target).await {
        warn!(error = %e, "Host setup failed");
    }
    let plan = DeployPlan::for_recipe(&recipe, &args.model_dir, &args.common.hf_token());
    deployer.deploy(&target, &plan).await?;
    Ok(ExitCode::SUCCESS)
}

async fn cloud(args: CloudArgs) -> Result<ExitCode, CliError> {
    let dry_run = args.common.dry_run;
    let recipe = recipes::load_recipe(&args.common.recipe)?;
    let gpu_name = recipe
        .deploy
        .gpu
        .clone()
        .ok_or_else(|| CliError::MissingGpu(args.common.recipe.clone()))?;
    let gpu_count = recipe.deploy.gpu_count;

    let providers = build_providers(&load_providers(&args.config)?, dry_run)?;
    check_provider(&providers, &gpu_name, gpu_count)?;
    let key = SshKeyPair::load(expand_home(&args.ssh_key), dry_run)?;

    let transport: Arc<dyn RemoteTransport> = Arc::new(SshTransport::new().with_dry_run(dry_run));
    let lifecycle = VmLifecycle::new(providers, transport.clone(), key).with_dry_run(dry_run);
    let conn = lifecycle
        .acquire(&AcquireRequest {
            label: args.name.clone(),
            gpu_name,
            gpu_count,
        })
        .await
        .map_err(CliError::Cloud)?;
    info!(
        instance = %conn.handle,
        address = %conn.address(),
        ssh_port = conn.ssh_port,
        "VM ready; it keeps running until deleted with `fleetbench vm delete`"
    );

    let target = conn.ssh_target(lifecycle.ssh_key_path());
    if let Err(e) = setup::prepare_host(transport.as_ref(), &target).await {
        warn!(error = %e, "Host setup failed");
    }
    let plan = DeployPlan::for_recipe(&recipe, &args.model_dir, &args.common.hf_token());
    Deployer::new(transport)
        .with_dry_run(dry_run)
        .deploy(&target, &plan)
        .await?;
    Ok(ExitCode::SUCCESS)
}

/// `user@host` -> (`user`, `host`); a bare host has no username.
fn split_server(server: &str) -> (&str, &str) {
    match server.split_once('@') {
        Some((user, host)) => (user, host),
        None => ("", server),
    }
}
