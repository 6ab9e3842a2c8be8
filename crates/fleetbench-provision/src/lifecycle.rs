//! VM lifecycle manager: polling state machine with guaranteed deletion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use fleetbench_core::VmState;
use fleetbench_remote::RemoteTransport;

use crate::provider::{ProviderRegistry, VmProvider};
use crate::registry::{InstanceRecord, InstanceRegistry};
use crate::types::{
    instance_name, CreateSpec, InstanceHandle, PollPolicy, ProviderStatus, VmConnectionInfo,
};
use crate::ProvisionError;

/// Private key path plus the matching public key text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKeyPair {
    pub private_key: PathBuf,
    pub public_key: String,
}

impl SshKeyPair {
    /// Load `{private_key}.pub`.
    ///
    /// In dry-run mode a missing public key yields a placeholder.
    pub fn load(private_key: impl Into<PathBuf>, dry_run: bool) -> Result<Self, ProvisionError> {
        let private_key = private_key.into();
        let mut pub_path = private_key.clone().into_os_string();
        pub_path.push(".pub");
        let pub_path = PathBuf::from(pub_path);

        match std::fs::read_to_string(&pub_path) {
            Ok(text) => Ok(Self {
                private_key,
                public_key: text.trim().to_string(),
            }),
            Err(_) if dry_run => Ok(Self {
                private_key,
                public_key: "dry-run-placeholder".to_string(),
            }),
            Err(source) => Err(ProvisionError::SshKey {
                path: pub_path,
                source,
            }),
        }
    }
}

/// Sizing for one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRequest {
    /// Execution group label; used for instance naming and logs.
    pub label: String,
    pub gpu_name: String,
    pub gpu_count: u32,
}

/// Drives provider adapters through request -> active -> SSH-ready.
///
/// Any VM that reaches the provider is deleted before `acquire` returns an
/// error. A VM handed out by `acquire` is deleted by `release`.
pub struct VmLifecycle {
    providers: ProviderRegistry,
    transport: Arc<dyn RemoteTransport>,
    ssh_key: SshKeyPair,
    registry: Option<InstanceRegistry>,
    dry_run: bool,
}

impl VmLifecycle {
    pub fn new(
        providers: ProviderRegistry,
        transport: Arc<dyn RemoteTransport>,
        ssh_key: SshKeyPair,
    ) -> Self {
        Self {
            providers,
            transport,
            ssh_key,
            registry: None,
            dry_run: false,
        }
    }

    /// Record every created VM in `registry`.
    pub fn with_registry(mut self, registry: InstanceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Log every provider call instead of making it.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn ssh_key_path(&self) -> &Path {
        &self.ssh_key.private_key
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Provision a VM and wait until it accepts SSH.
    pub async fn acquire(&self, req: &AcquireRequest) -> Result<VmConnectionInfo, ProvisionError> {
        let (provider, instance_type) = self.providers.resolve(&req.gpu_name, req.gpu_count)?;
        let policy = provider.poll_policy();
        let spec = CreateSpec {
            name: instance_name(&req.label),
            instance_type,
            gpu_count: req.gpu_count,
            ssh_public_key: self.ssh_key.public_key.clone(),
        };
        info!(
            group = %req.label,
            gpu = %req.gpu_name,
            gpu_count = req.gpu_count,
            provider = %provider.kind(),
            instance_type = %spec.instance_type,
            "Acquiring VM"
        );

        if self.dry_run {
            return Ok(self.dry_run_acquire(provider.as_ref(), &spec, &policy));
        }

        let mut state = VmState::Requested;

        let handle = match provider.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                advance(&mut state, VmState::Failed, &req.label)?;
                error!(group = %req.label, error = %e, "VM create call failed");
                return Err(e);
            }
        };
        advance(&mut state, VmState::Provisioning, &req.label)?;

        if let Some(registry) = &self.registry {
            let record = InstanceRecord::new(
                handle.clone(),
                &req.label,
                &req.gpu_name,
                req.gpu_count,
            );
            if let Err(e) = registry.register(record) {
                warn!(group = %req.label, instance = %handle, error = %e, "Failed to register instance");
            }
        }

        match self
            .bring_up(provider.as_ref(), &handle, &policy, &mut state, &req.label)
            .await
        {
            Ok(conn) => Ok(conn),
            Err(e) => {
                error!(group = %req.label, instance = %handle, error = %e, "VM acquisition failed, deleting instance");
                if let Err(del) = self.delete(provider.as_ref(), &handle).await {
                    error!(
                        group = %req.label,
                        instance = %handle,
                        error = %del,
                        "Failed to delete instance after acquisition failure; manual cleanup required"
                    );
                } else {
                    advance(&mut state, VmState::Released, &req.label)?;
                }
                Err(e)
            }
        }
    }

    /// Provisioning -> Active -> Ready.
    async fn bring_up(
        &self,
        provider: &dyn VmProvider,
        handle: &InstanceHandle,
        policy: &PollPolicy,
        state: &mut VmState,
        label: &str,
    ) -> Result<VmConnectionInfo, ProvisionError> {
        if let Err(e) = wait_for_active(provider, handle, policy, label).await {
            advance(state, VmState::Failed, label)?;
            return Err(e);
        }
        advance(state, VmState::Active, label)?;

        let conn = match provider
            .extract_connection(handle)
            .await
            .and_then(VmConnectionInfo::validate)
        {
            Ok(conn) => conn,
            Err(e) => {
                advance(state, VmState::Failed, label)?;
                return Err(e);
            }
        };

        if let Some(registry) = &self.registry {
            if let Err(e) = registry.record_connection(&conn) {
                warn!(group = %label, error = %e, "Failed to record instance address");
            }
        }

        if let Err(e) = self.wait_for_ssh(&conn, policy, label).await {
            advance(state, VmState::Failed, label)?;
            return Err(e);
        }
        advance(state, VmState::Ready, label)?;
        info!(group = %label, address = %conn.address(), ssh_port = conn.ssh_port, "VM ready");
        Ok(conn)
    }

    async fn wait_for_ssh(
        &self,
        conn: &VmConnectionInfo,
        policy: &PollPolicy,
        label: &str,
    ) -> Result<(), ProvisionError> {
        let target = conn.ssh_target(&self.ssh_key.private_key);
        info!(
            group = %label,
            address = %target.address(),
            timeout_secs = policy.ssh_timeout.as_secs(),
            "Waiting for SSH connectivity"
        );
        let deadline = Instant::now() + policy.ssh_timeout;
        loop {
            if self.transport.probe(&target).await {
                return Ok(());
            }
            if Instant::now() + policy.ssh_interval > deadline {
                return Err(ProvisionError::SshTimeout {
                    address: format!("{}:{}", target.address(), target.port),
                    timeout_secs: policy.ssh_timeout.as_secs(),
                });
            }
            sleep(policy.ssh_interval).await;
        }
    }

    /// Delete a VM handed out by [`acquire`](Self::acquire).
    ///
    /// Not retried; a failure is returned for the caller to log.
    pub async fn release(&self, conn: &VmConnectionInfo) -> Result<(), ProvisionError> {
        let provider = self.providers.get(conn.handle.provider())?;
        if self.dry_run {
            info!("[dry-run] delete instance {}", conn.handle);
            return Ok(());
        }
        self.delete(provider.as_ref(), &conn.handle).await?;
        info!(instance = %conn.handle, "VM released");
        Ok(())
    }

    /// Delete any registered instance by handle (used by teardown).
    pub async fn delete_handle(&self, handle: &InstanceHandle) -> Result<(), ProvisionError> {
        let provider = self.providers.get(handle.provider())?;
        if self.dry_run {
            info!("[dry-run] delete instance {}", handle);
            return Ok(());
        }
        self.delete(provider.as_ref(), handle).await
    }

    async fn delete(
        &self,
        provider: &dyn VmProvider,
        handle: &InstanceHandle,
    ) -> Result<(), ProvisionError> {
        provider.delete(handle).await?;
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.remove(handle) {
                warn!(instance = %handle, error = %e, "Failed to remove instance from registry");
            }
        }
        Ok(())
    }

    fn dry_run_acquire(
        &self,
        provider: &dyn VmProvider,
        spec: &CreateSpec,
        policy: &PollPolicy,
    ) -> VmConnectionInfo {
        info!(
            "[dry-run] create {} instance {} type={}",
            provider.kind(),
            spec.name,
            spec.instance_type
        );
        info!(
            "[dry-run] poll every {}s (up to {}s) for active status",
            policy.interval.as_secs(),
            policy.timeout.as_secs()
        );
        info!(
            "[dry-run] poll SSH every {}s (up to {}s)",
            policy.ssh_interval.as_secs(),
            policy.ssh_timeout.as_secs()
        );
        let handle = match provider.kind() {
            fleetbench_core::ProviderKind::CloudRift => InstanceHandle::CloudRift {
                instance_id: "dry-run-id".to_string(),
            },
            fleetbench_core::ProviderKind::Gcp => InstanceHandle::Gcp {
                instance: spec.name.clone(),
                zone: "dry-run-zone".to_string(),
            },
        };
        VmConnectionInfo {
            host: "dry-run-host".to_string(),
            username: "dry-run-user".to_string(),
            ssh_port: 22,
            port_mappings: Vec::new(),
            handle,
        }
    }
}

fn advance(state: &mut VmState, next: VmState, label: &str) -> Result<(), ProvisionError> {
    let from = *state;
    *state = from.transition(next)?;
    debug!(group = %label, from = %from, to = %next, "VM state changed");
    Ok(())
}

/// Poll until the provider reports active, fails, or `policy.timeout` passes.
///
/// Poll call errors are logged and retried until the deadline.
async fn wait_for_active(
    provider: &dyn VmProvider,
    handle: &InstanceHandle,
    policy: &PollPolicy,
    label: &str,
) -> Result<(), ProvisionError> {
    info!(
        group = %label,
        instance = %handle,
        timeout_secs = policy.timeout.as_secs(),
        "Waiting for instance to become active"
    );
    let deadline = Instant::now() + policy.timeout;
    let mut last_status = String::from("unknown");
    loop {
        match provider.poll(handle).await {
            Ok(ProviderStatus::Active) => {
                info!(group = %label, instance = %handle, "Instance is active");
                return Ok(());
            }
            Ok(ProviderStatus::Failed(status)) => {
                return Err(ProvisionError::ProviderFailed {
                    instance: handle.to_string(),
                    status,
                });
            }
            Ok(ProviderStatus::Pending(status)) => {
                debug!(group = %label, instance = %handle, status = %status, "Instance not active yet");
                last_status = status;
            }
            Err(e) => {
                warn!(group = %label, instance = %handle, error = %e, "Status poll failed");
            }
        }

        if Instant::now() + policy.interval > deadline {
            return Err(ProvisionError::ProvisionTimeout {
                instance: handle.to_string(),
                timeout_secs: policy.timeout.as_secs(),
                last_status,
            });
        }
        sleep(policy.interval).await;
    }
}
