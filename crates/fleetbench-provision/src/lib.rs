//! FleetBench VM provisioning.
//!
//! Provider adapters ([`CloudRiftProvider`], [`GcpProvider`]) implement the
//! uniform [`VmProvider`] capability set. [`VmLifecycle`] drives any of them
//! through the request -> active -> SSH-ready state machine and guarantees
//! that a created VM is deleted on every failure path. Every created VM is
//! also written to the run's [`InstanceRegistry`] so a killed process's VMs
//! can be found and deleted later.

pub mod cloudrift;
pub mod error;
pub mod gcp;
pub mod lifecycle;
pub mod provider;
pub mod registry;
pub mod types;

pub use cloudrift::{CloudRiftConfig, CloudRiftProvider};
pub use error::ProvisionError;
pub use gcp::{GcpConfig, GcpProvider};
pub use lifecycle::{AcquireRequest, SshKeyPair, VmLifecycle};
pub use provider::{ProviderRegistry, VmProvider};
pub use registry::{InstanceRecord, InstanceRegistry, INSTANCES_FILE};
pub use types::{CreateSpec, InstanceHandle, PollPolicy, ProviderStatus, VmConnectionInfo};
