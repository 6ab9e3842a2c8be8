//! CloudRift adapter over the REST API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use fleetbench_core::ProviderKind;

use crate::provider::VmProvider;
use crate::types::{CreateSpec, InstanceHandle, PollPolicy, ProviderStatus, VmConnectionInfo};
use crate::ProvisionError;

pub const DEFAULT_API_URL: &str = "https://api.cloudrift.ai";
const DEFAULT_IMAGE_URL: &str = "https://storage.googleapis.com/cloudrift-vm-disks/disks/github/ubuntu-noble-server-gpu-580-129-20251015-183936.img";
const DEFAULT_CLOUDINIT_URL: &str =
    "https://storage.googleapis.com/cloudrift-vm-disks/cloudinit/ubuntu-base.cloudinit";
const API_VERSION: &str = "~upcoming";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const ACTIVE_STATUS: &str = "Active";
const FAIL_STATUSES: &[&str] = &["Inactive"];

/// `[providers.cloudrift]` configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudRiftConfig {
    pub api_url: String,
    pub image_url: String,
    pub cloudinit_url: String,
    /// Ports exposed on the public IP.
    pub ports: Vec<u16>,
    pub poll_interval_secs: u64,
    pub provision_timeout_secs: u64,
    pub ssh_poll_interval_secs: u64,
    pub ssh_timeout_secs: u64,
}

impl Default for CloudRiftConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            image_url: DEFAULT_IMAGE_URL.to_string(),
            cloudinit_url: DEFAULT_CLOUDINIT_URL.to_string(),
            ports: vec![22, 8000, 8080],
            poll_interval_secs: 10,
            provision_timeout_secs: 600,
            ssh_poll_interval_secs: 5,
            ssh_timeout_secs: 120,
        }
    }
}

/// CloudRift REST adapter.
#[derive(Debug, Clone)]
pub struct CloudRiftProvider {
    client: reqwest::Client,
    api_key: String,
    config: CloudRiftConfig,
}

impl CloudRiftProvider {
    pub fn new(api_key: impl Into<String>, config: CloudRiftConfig) -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            config,
        })
    }

    /// POST `data` wrapped in the versioned envelope; returns the response `data`.
    async fn request(&self, path: &str, data: Value) -> Result<Value, ProvisionError> {
        let url = format!("{}{}", self.config.api_url, path);
        debug!(url = %url, "CloudRift API request");

        let response = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .json(&json!({ "version": API_VERSION, "data": data }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Api(format!(
                "{} returned {}: {}",
                path,
                status,
                body.trim()
            )));
        }

        let mut body: Value = response.json().await?;
        Ok(match body.get_mut("data") {
            Some(data) => data.take(),
            None => body,
        })
    }

    async fn instance_info(&self, instance_id: &str) -> Result<Option<Value>, ProvisionError> {
        let mut result = self
            .request(
                "/api/v1/instances/list",
                json!({ "selector": { "ById": [instance_id] } }),
            )
            .await?;
        Ok(result
            .get_mut("instances")
            .and_then(Value::as_array_mut)
            .and_then(|list| if list.is_empty() { None } else { Some(list.swap_remove(0)) }))
    }

    fn rent_payload(&self, spec: &CreateSpec) -> Value {
        json!({
            "selector": {
                "ByInstanceTypeAndLocation": { "instance_type": spec.instance_type }
            },
            "config": {
                "VirtualMachine": {
                    "ssh_key": { "PublicKeys": [spec.ssh_public_key] },
                    "image_url": self.config.image_url,
                    "cloudinit_url": self.config.cloudinit_url,
                }
            },
            "with_public_ip": true,
            "ports": self.config.ports.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
        })
    }
}

fn cloudrift_id(handle: &InstanceHandle) -> Result<&str, ProvisionError> {
    match handle {
        InstanceHandle::CloudRift { instance_id } => Ok(instance_id),
        other => Err(ProvisionError::Api(format!(
            "CloudRift cannot handle instance {}",
            other
        ))),
    }
}

/// Map an instance's raw status onto [`ProviderStatus`].
pub fn parse_status(instance: Option<&Value>) -> ProviderStatus {
    let Some(instance) = instance else {
        return ProviderStatus::Pending("not found".to_string());
    };
    let status = instance
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    if status == ACTIVE_STATUS {
        ProviderStatus::Active
    } else if FAIL_STATUSES.contains(&status) {
        ProviderStatus::Failed(status.to_string())
    } else {
        ProviderStatus::Pending(status.to_string())
    }
}

/// Build connection details from an instance record.
///
/// Port mappings are `[internal, external]` pairs; SSH uses the external
/// port mapped to 22.
pub fn parse_connection(instance: &Value, instance_id: &str) -> VmConnectionInfo {
    let host = instance
        .get("host_address")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let username = instance
        .pointer("/virtual_machines/0/login_info/UsernameAndPassword/username")
        .and_then(Value::as_str)
        .unwrap_or("user")
        .to_string();

    let port_mappings: Vec<(u16, u16)> = instance
        .get("port_mappings")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|pair| {
                    let internal = pair.get(0)?.as_u64()?;
                    let external = pair.get(1)?.as_u64()?;
                    Some((u16::try_from(internal).ok()?, u16::try_from(external).ok()?))
                })
                .collect()
        })
        .unwrap_or_default();

    let ssh_port = port_mappings
        .iter()
        .find(|(internal, _)| *internal == 22)
        .map(|(_, external)| *external)
        .unwrap_or(22);

    VmConnectionInfo {
        host,
        username,
        ssh_port,
        port_mappings,
        handle: InstanceHandle::CloudRift {
            instance_id: instance_id.to_string(),
        },
    }
}

#[async_trait]
impl VmProvider for CloudRiftProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CloudRift
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
        info!(instance_type = %spec.instance_type, "Renting CloudRift instance");
        let result = self
            .request("/api/v1/instances/rent", self.rent_payload(spec))
            .await?;

        let instance_id = result
            .get("instance_ids")
            .and_then(Value::as_array)
            .and_then(|ids| ids.first())
            .and_then(Value::as_str)
            .ok_or_else(|| ProvisionError::Api("no instance ID returned from rent API".to_string()))?;

        info!(instance_id = %instance_id, "CloudRift instance rented");
        Ok(InstanceHandle::CloudRift {
            instance_id: instance_id.to_string(),
        })
    }

    async fn poll(&self, handle: &InstanceHandle) -> Result<ProviderStatus, ProvisionError> {
        let id = cloudrift_id(handle)?;
        let info = self.instance_info(id).await?;
        Ok(parse_status(info.as_ref()))
    }

    async fn extract_connection(
        &self,
        handle: &InstanceHandle,
    ) -> Result<VmConnectionInfo, ProvisionError> {
        let id = cloudrift_id(handle)?;
        let info = self
            .instance_info(id)
            .await?
            .ok_or_else(|| ProvisionError::Api(format!("instance {} not found", id)))?;
        let conn = parse_connection(&info, id);
        info!(
            host = %conn.host,
            user = %conn.username,
            ssh_port = conn.ssh_port,
            "CloudRift instance reachable at ssh -p {} {}",
            conn.ssh_port,
            conn.address()
        );
        Ok(conn)
    }

    async fn delete(&self, handle: &InstanceHandle) -> Result<(), ProvisionError> {
        let id = cloudrift_id(handle)?;
        info!(instance_id = %id, "Terminating CloudRift instance");
        self.request(
            "/api/v1/instances/terminate",
            json!({ "selector": { "ById": [id] } }),
        )
        .await?;
        Ok(())
    }
}
