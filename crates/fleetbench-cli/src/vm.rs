//! `vm create|delete`: manage a single cloud VM by hand.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Subcommand};
use tracing::info;

use fleetbench_core::ProviderKind;
use fleetbench_provision::{AcquireRequest, InstanceHandle, ProvisionError, SshKeyPair, VmLifecycle};
use fleetbench_remote::SshTransport;

use crate::{build_providers, check_provider, expand_home, load_providers, CliError, CLOUDRIFT_API_KEY};

#[derive(Subcommand)]
pub enum VmAction {
    /// Create a VM for a GPU model and wait until it accepts SSH
    Create(CreateArgs),

    /// Delete a VM
    Delete(DeleteArgs),
}

#[derive(Args)]
pub struct CreateArgs {
    /// Full GPU name, e.g. "NVIDIA H100 80GB"
    #[arg(long)]
    gpu: String,

    #[arg(long, default_value_t = 1)]
    gpu_count: u32,

    /// Instance name prefix
    #[arg(long, default_value = "fleetbench-vm")]
    name: String,

    /// SSH private key; `{key}.pub` is installed on the VM
    #[arg(long, default_value = "~/.ssh/id_ed25519")]
    ssh_key: String,

    /// Configuration file (provider settings)
    #[arg(long, default_value = "fleetbench.toml")]
    config: PathBuf,

    /// Print provider calls without executing
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
pub struct DeleteArgs {
    #[command(subcommand)]
    instance: InstanceArg,

    /// Configuration file (provider settings)
    #[arg(long, global = true, default_value = "fleetbench.toml")]
    config: PathBuf,

    /// Print provider calls without executing
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
pub enum InstanceArg {
    /// CloudRift instance
    Cloudrift {
        #[arg(long)]
        instance_id: String,
    },

    /// GCP instance
    Gcp {
        #[arg(long)]
        instance: String,

        #[arg(long)]
        zone: String,
    },
}

impl From<InstanceArg> for InstanceHandle {
    fn from(arg: InstanceArg) -> Self {
        match arg {
            InstanceArg::Cloudrift { instance_id } => InstanceHandle::CloudRift { instance_id },
            InstanceArg::Gcp { instance, zone } => InstanceHandle::Gcp { instance, zone },
        }
    }
}

pub async fn run(action: VmAction) -> Result<ExitCode, CliError> {
    match action {
        VmAction::Create(args) => create(args).await,
        VmAction::Delete(args) => delete(args).await,
    }
}

async fn create(args: CreateArgs) -> Result<ExitCode, CliError> {
    let providers = build_providers(&load_providers(&args.config)?, args.dry_run)?;
    check_provider(&providers, &args.gpu, args.gpu_count)?;
    let key = SshKeyPair::load(expand_home(&args.ssh_key), args.dry_run)?;

    let transport = Arc::new(SshTransport::new().with_dry_run(args.dry_run));
    let lifecycle = VmLifecycle::new(providers, transport, key).with_dry_run(args.dry_run);
    let conn = lifecycle
        .acquire(&AcquireRequest {
            label: args.name,
            gpu_name: args.gpu,
            gpu_count: args.gpu_count,
        })
        .await
        .map_err(CliError::Cloud)?;

    info!(
        instance = %conn.handle,
        address = %conn.address(),
        ssh_port = conn.ssh_port,
        "VM ready"
    );
    for (internal, external) in &conn.port_mappings {
        info!("Port {} -> {}", internal, external);
    }
    Ok(ExitCode::SUCCESS)
}

async fn delete(args: DeleteArgs) -> Result<ExitCode, CliError> {
    let handle = InstanceHandle::from(args.instance);
    let providers = build_providers(&load_providers(&args.config)?, args.dry_run)?;
    if handle.provider() == ProviderKind::CloudRift && providers.get(ProviderKind::CloudRift).is_err() {
        return Err(ProvisionError::MissingCredential(CLOUDRIFT_API_KEY).into());
    }

    // Deleting never connects to the VM.
    let key = SshKeyPair {
        private_key: PathBuf::new(),
        public_key: String::new(),
    };
    let transport = Arc::new(SshTransport::new().with_dry_run(args.dry_run));
    let lifecycle = VmLifecycle::new(providers, transport, key).with_dry_run(args.dry_run);
    lifecycle
        .delete_handle(&handle)
        .await
        .map_err(CliError::Cloud)?;
    info!(instance = %handle, "VM deleted");
    Ok(ExitCode::SUCCESS)
}
