//! Registry-driven cleanup of VMs a run left behind.

use tracing::{error, info, warn};

use fleetbench_provision::{InstanceHandle, InstanceRegistry, VmLifecycle};

use crate::deploy::Deployer;
use crate::EngineError;

/// What `teardown_run` did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub deleted: Vec<InstanceHandle>,
    pub failed: Vec<InstanceHandle>,
}

impl TeardownReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Stop containers on and delete every VM recorded in `registry`.
///
/// Successfully deleted instances are removed from the registry (the file
/// goes away once empty); failed ones stay for another attempt.
pub async fn teardown_run(
    registry: &InstanceRegistry,
    lifecycle: &VmLifecycle,
    deployer: &Deployer,
) -> Result<TeardownReport, EngineError> {
    let records = registry.load()?;
    let mut report = TeardownReport::default();
    if records.is_empty() {
        info!(path = %registry.path().display(), "No instances recorded; nothing to tear down");
        return Ok(report);
    }
    info!(count = records.len(), "Tearing down recorded instances");

    for record in records {
        info!(instance = %record.handle, label = %record.label, "Tearing down instance");
        match record.connection() {
            Some(conn) => {
                let target = conn.ssh_target(lifecycle.ssh_key_path());
                if let Err(e) = deployer.teardown(&target).await {
                    warn!(instance = %record.handle, error = %e, "Failed to stop containers");
                }
            }
            None => info!(instance = %record.handle, "No address recorded; skipping container shutdown"),
        }

        match lifecycle.delete_handle(&record.handle).await {
            Ok(()) => {
                info!(instance = %record.handle, "Instance deleted");
                report.deleted.push(record.handle);
            }
            Err(e) => {
                error!(instance = %record.handle, error = %e, "Failed to delete instance");
                report.failed.push(record.handle);
            }
        }
    }
    Ok(report)
}
