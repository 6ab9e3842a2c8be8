//! GCP adapter over the `gcloud` CLI.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use fleetbench_core::ProviderKind;
use fleetbench_remote::LocalCommand;

use crate::provider::VmProvider;
use crate::types::{CreateSpec, InstanceHandle, PollPolicy, ProviderStatus, VmConnectionInfo};
use crate::ProvisionError;

const GCLOUD_TIMEOUT: Duration = Duration::from_secs(600);
const RUNNING_STATUS: &str = "RUNNING";
const FAIL_STATUSES: &[&str] = &["TERMINATED", "STOPPING", "SUSPENDED"];

/// `[providers.gcp]` configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcpConfig {
    pub zone: String,
    /// FLEX_START, SPOT or STANDARD.
    pub provisioning_model: String,
    pub max_run_duration: String,
    pub request_valid_for_duration: String,
    pub termination_action: String,
    pub image_family: String,
    pub image_project: String,
    /// Login user; defaults to `$USER`.
    pub ssh_user: Option<String>,
    /// Falls back to `GCP_SERVICE_ACCOUNT`.
    pub service_account: Option<String>,
    pub boot_disk_size: Option<String>,
    pub tags: Option<String>,
    /// Appended to `create`, split with shell quoting rules.
    pub extra_gcloud_args: String,
    pub poll_interval_secs: u64,
    pub provision_timeout_secs: u64,
    pub ssh_poll_interval_secs: u64,
    pub ssh_timeout_secs: u64,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            zone: "us-central1-b".to_string(),
            provisioning_model: "FLEX_START".to_string(),
            max_run_duration: "7d".to_string(),
            request_valid_for_duration: "2h".to_string(),
            termination_action: "DELETE".to_string(),
            image_family: "debian-12".to_string(),
            image_project: "debian-cloud".to_string(),
            ssh_user: None,
            service_account: None,
            boot_disk_size: None,
            tags: None,
            extra_gcloud_args: String::new(),
            poll_interval_secs: 10,
            provision_timeout_secs: 14400,
            ssh_poll_interval_secs: 10,
            ssh_timeout_secs: 300,
        }
    }
}

impl GcpConfig {
    /// Configured login user, else `$USER`, else `deploy`.
    pub fn resolved_ssh_user(&self) -> String {
        self.ssh_user
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| std::env::var("USER").ok().filter(|u| !u.is_empty()))
            .unwrap_or_else(|| "deploy".to_string())
    }

    fn resolved_service_account(&self) -> Option<String> {
        self.service_account
            .clone()
            .or_else(|| std::env::var("GCP_SERVICE_ACCOUNT").ok())
            .filter(|s| !s.is_empty())
    }
}

/// GCP adapter; every operation is one `gcloud compute instances` call.
#[derive(Debug, Clone)]
pub struct GcpProvider {
    config: GcpConfig,
    ssh_user: String,
}

impl GcpProvider {
    pub fn new(config: GcpConfig) -> Self {
        let ssh_user = config.resolved_ssh_user();
        Self { config, ssh_user }
    }

    fn gcloud(&self) -> LocalCommand {
        LocalCommand::new("gcloud").args(["compute", "instances"])
    }

    /// `gcloud compute instances create ...` for a spec.
    pub fn create_command(&self, spec: &CreateSpec) -> Result<LocalCommand, ProvisionError> {
        let cfg = &self.config;
        let mut cmd = self.gcloud().args([
            "create".to_string(),
            spec.name.clone(),
            "--zone".to_string(),
            cfg.zone.clone(),
            "--machine-type".to_string(),
            spec.instance_type.clone(),
            format!("--provisioning-model={}", cfg.provisioning_model),
            "--maintenance-policy=TERMINATE".to_string(),
            "--reservation-affinity=none".to_string(),
            "--image-family".to_string(),
            cfg.image_family.clone(),
            "--image-project".to_string(),
            cfg.image_project.clone(),
        ]);

        // Duration and termination flags are only valid for FLEX_START.
        if cfg.provisioning_model == "FLEX_START" {
            cmd = cmd
                .args(["--max-run-duration", cfg.max_run_duration.as_str()])
                .arg(format!(
                    "--instance-termination-action={}",
                    cfg.termination_action
                ));
            if !cfg.request_valid_for_duration.is_empty() {
                cmd = cmd.args([
                    "--request-valid-for-duration",
                    cfg.request_valid_for_duration.as_str(),
                ]);
            }
        }

        if let Some(account) = cfg.resolved_service_account() {
            cmd = cmd
                .arg(format!("--service-account={}", account))
                .arg("--scopes=https://www.googleapis.com/auth/cloud-platform");
        }
        if let Some(size) = cfg.boot_disk_size.as_deref().filter(|s| !s.is_empty()) {
            cmd = cmd.arg(format!("--boot-disk-size={}", size));
        }
        if let Some(tags) = cfg.tags.as_deref().filter(|s| !s.is_empty()) {
            cmd = cmd.arg(format!("--tags={}", tags));
        }
        if !spec.ssh_public_key.is_empty() {
            cmd = cmd.arg(format!(
                "--metadata=ssh-keys={}:{}",
                self.ssh_user, spec.ssh_public_key
            ));
        }
        let extra = shlex::split(&cfg.extra_gcloud_args).ok_or_else(|| {
            ProvisionError::Api(format!(
                "unbalanced quotes in extra_gcloud_args: {}",
                cfg.extra_gcloud_args
            ))
        })?;
        Ok(cmd.args(extra))
    }

    fn describe_command(&self, instance: &str, zone: &str, format: &str) -> LocalCommand {
        self.gcloud().args([
            "describe",
            instance,
            "--zone",
            zone,
            "--format",
            format,
        ])
    }
}

fn gcp_instance(handle: &InstanceHandle) -> Result<(&str, &str), ProvisionError> {
    match handle {
        InstanceHandle::Gcp { instance, zone } => Ok((instance, zone)),
        other => Err(ProvisionError::Api(format!(
            "GCP cannot handle instance {}",
            other
        ))),
    }
}

/// Map `describe --format value(status)` output onto [`ProviderStatus`].
pub fn parse_status(raw: &str) -> ProviderStatus {
    let status = raw.trim();
    if status == RUNNING_STATUS {
        ProviderStatus::Active
    } else if FAIL_STATUSES.contains(&status) {
        ProviderStatus::Failed(status.to_string())
    } else {
        ProviderStatus::Pending(status.to_string())
    }
}

#[async_trait]
impl VmProvider for GcpProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gcp
    }

    fn poll_policy(&self) -> PollPolicy {
        PollPolicy::from_secs(
            self.config.poll_interval_secs,
            self.config.provision_timeout_secs,
            self.config.ssh_poll_interval_secs,
            self.config.ssh_timeout_secs,
        )
    }

    async fn create(&self, spec: &CreateSpec) -> Result<InstanceHandle, ProvisionError> {
        info!(
            instance = %spec.name,
            zone = %self.config.zone,
            machine_type = %spec.instance_type,
            provisioning = %self.config.provisioning_model,
            "Creating GCP instance"
        );
        let output = self.create_command(spec)?.run(GCLOUD_TIMEOUT).await?;
        if !output.success() {
            return Err(ProvisionError::Api(format!(
                "failed to create instance {}: {}",
                spec.name,
                output.stderr.trim()
            )));
        }
        Ok(InstanceHandle::Gcp {
            instance: spec.name.clone(),
            zone: self.config.zone.clone(),
        })
    }

    async fn poll(&self, handle: &InstanceHandle) -> Result<ProviderStatus, ProvisionError> {
        let (instance, zone) = gcp_instance(handle)?;
        let output = self
            .describe_command(instance, zone, "value(status)")
            .run(GCLOUD_TIMEOUT)
            .await?;
        if !output.success() {
            // Not visible yet, or a transient API error; keep polling.
            return Ok(ProviderStatus::Pending(format!(
                "describe failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(parse_status(&output.stdout))
    }

    async fn extract_connection(
        &self,
        handle: &InstanceHandle,
    ) -> Result<VmConnectionInfo, ProvisionError> {
        let (instance, zone) = gcp_instance(handle)?;
        let output = self
            .describe_command(
                instance,
                zone,
                "value(networkInterfaces[0].accessConfigs[0].natIP)",
            )
            .run(GCLOUD_TIMEOUT)
            .await?;
        let host = if output.success() {
            output.stdout.trim().to_string()
        } else {
            String::new()
        };
        if host.is_empty() {
            warn!(instance = %instance, "No external IP found");
        } else {
            info!(instance = %instance, external_ip = %host, "GCP instance running");
        }
        Ok(VmConnectionInfo {
            host,
            username: self.ssh_user.clone(),
            ssh_port: 22,
            port_mappings: Vec::new(),
            handle: handle.clone(),
        })
    }

    async fn delete(&self, handle: &InstanceHandle) -> Result<(), ProvisionError> {
        let (instance, zone) = gcp_instance(handle)?;
        info!(instance = %instance, zone = %zone, "Deleting GCP instance");
        self.gcloud()
            .args(["delete", instance, "--zone", zone, "--quiet"])
            .run(GCLOUD_TIMEOUT)
            .await?
            .into_result()?;
        Ok(())
    }
}
