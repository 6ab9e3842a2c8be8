//! Shared data types for VM providers.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleetbench_core::ProviderKind;
use fleetbench_remote::SshTarget;

use crate::ProvisionError;

/// Provider-specific handle used to poll and delete an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum InstanceHandle {
    #[serde(rename = "cloudrift")]
    CloudRift { instance_id: String },
    Gcp { instance: String, zone: String },
}

impl InstanceHandle {
    pub fn provider(&self) -> ProviderKind {
        match self {
            Self::CloudRift { .. } => ProviderKind::CloudRift,
            Self::Gcp { .. } => ProviderKind::Gcp,
        }
    }

    /// Provider-side instance identifier.
    pub fn instance_id(&self) -> &str {
        match self {
            Self::CloudRift { instance_id } => instance_id,
            Self::Gcp { instance, .. } => instance,
        }
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CloudRift { instance_id } => write!(f, "cloudrift:{}", instance_id),
            Self::Gcp { instance, zone } => write!(f, "gcp:{}/{}", zone, instance),
        }
    }
}

/// Everything needed to reach and later delete a provisioned VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConnectionInfo {
    pub host: String,
    pub username: String,
    pub ssh_port: u16,
    /// `(internal, external)` port pairs.
    #[serde(default)]
    pub port_mappings: Vec<(u16, u16)>,
    pub handle: InstanceHandle,
}

impl VmConnectionInfo {
    /// `user@host`, or just `host` without a username.
    pub fn address(&self) -> String {
        if self.username.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.username, self.host)
        }
    }

    /// Reject descriptors without an address or a deletion handle.
    pub fn validate(self) -> Result<Self, ProvisionError> {
        if self.handle.instance_id().trim().is_empty() {
            return Err(ProvisionError::InvalidConnection {
                instance: self.handle.to_string(),
                reason: "empty instance id".to_string(),
            });
        }
        if self.host.trim().is_empty() {
            return Err(ProvisionError::InvalidConnection {
                instance: self.handle.to_string(),
                reason: "no reachable address".to_string(),
            });
        }
        Ok(self)
    }

    /// External port mapped to `internal`, if the provider remaps ports.
    pub fn external_port(&self, internal: u16) -> Option<u16> {
        self.port_mappings
            .iter()
            .find(|(i, _)| *i == internal)
            .map(|(_, e)| *e)
    }

    pub fn ssh_target(&self, key_path: &Path) -> SshTarget {
        SshTarget::new(&self.host, &self.username, self.ssh_port, key_path)
    }
}

/// Status reported by a provider poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    /// Still booting; carries the provider's raw status.
    Pending(String),
    /// Provider reports the instance running.
    Active,
    /// Provider-declared failure; stop polling.
    Failed(String),
}

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    /// Unique, DNS-safe instance name.
    pub name: String,
    pub instance_type: String,
    pub gpu_count: u32,
    pub ssh_public_key: String,
}

/// Poll interval and timeouts for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    pub ssh_interval: Duration,
    pub ssh_timeout: Duration,
}

impl PollPolicy {
    pub fn from_secs(interval: u64, timeout: u64, ssh_interval: u64, ssh_timeout: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
            ssh_interval: Duration::from_secs(ssh_interval),
            ssh_timeout: Duration::from_secs(ssh_timeout),
        }
    }
}

/// Build a unique, DNS-safe instance name: `bench-{label}-{8 hex}`.
pub fn instance_name(label: &str) -> String {
    const MAX_LEN: usize = 63;
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];

    let mut clean = String::with_capacity(label.len());
    for c in label.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            clean.push(c);
        } else if !clean.ends_with('-') {
            clean.push('-');
        }
    }
    let clean = clean.trim_matches('-');

    let budget = MAX_LEN - "bench-".len() - 1 - suffix.len();
    let body: String = clean.chars().take(budget).collect();
    let body = body.trim_end_matches('-');
    if body.is_empty() {
        format!("bench-{}", suffix)
    } else {
        format!("bench-{}-{}", body, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(host: &str, id: &str) -> VmConnectionInfo {
        VmConnectionInfo {
            host: host.to_string(),
            username: "riftuser".to_string(),
            ssh_port: 22,
            port_mappings: vec![(22, 30022), (8000, 38000)],
            handle: InstanceHandle::CloudRift {
                instance_id: id.to_string(),
            },
        }
    }

    #[test]
    fn test_validate() {
        assert!(conn("1.2.3.4", "abc").validate().is_ok());
        assert!(conn("", "abc").validate().is_err());
        assert!(conn("1.2.3.4", "").validate().is_err());
    }

    #[test]
    fn test_external_port() {
        let c = conn("h", "i");
        assert_eq!(c.external_port(8000), Some(38000));
        assert_eq!(c.external_port(8080), None);
        assert_eq!(c.address(), "riftuser@h");
    }

    #[test]
    fn test_handle_serde_is_tagged() {
        let handle = InstanceHandle::Gcp {
            instance: "bench-x".to_string(),
            zone: "us-central1-b".to_string(),
        };
        let json = serde_json::to_value(&handle).unwrap();
        assert_eq!(json["provider"], "gcp");
        assert_eq!(json["instance"], "bench-x");

        let rift: InstanceHandle =
            serde_json::from_str(r#"{"provider":"cloudrift","instance_id":"i-1"}"#).unwrap();
        assert_eq!(rift.provider(), ProviderKind::CloudRift);
        assert_eq!(rift.instance_id(), "i-1");
    }

    #[test]
    fn test_instance_name_is_dns_safe_and_unique() {
        let a = instance_name("RTX5090x4_Qwen3.8B");
        let b = instance_name("RTX5090x4_Qwen3.8B");
        assert_ne!(a, b);
        assert!(a.starts_with("bench-rtx5090x4-qwen3-8b-"));
        assert!(a
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));

        let long = instance_name(&"x".repeat(200));
        assert!(long.len() <= 63);
    }
}
