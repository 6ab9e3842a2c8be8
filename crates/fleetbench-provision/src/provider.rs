//! Provider adapter capability set and dispatch table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use fleetbench_core::{hardware, ProviderKind};

use crate::types::{CreateSpec, InstanceHandle, PollPolicy, ProviderStatus, VmConnectionInfo};
use crate::ProvisionError;

/// One cloud's create/poll/delete/extract-connection operations.
///
/// Adapters never poll in a loop themselves; the lifecycle manager owns
/// the interval and timeout.
#[async_trait]
pub trait VmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Interval and timeouts the lifecycle manager should use.
    fn poll_policy(&self) -> PollPolicy;

    /// Issue the create call. The returned handle must be deletable even if
    /// the instance never becomes active.
    async fn create(&self, spec: &CreateSpec) -> Result<InstanceHandle, ProvisionError>;

    /// Single status check.
    async fn poll(&self, handle: &InstanceHandle) -> Result<ProviderStatus, ProvisionError>;

    /// Connection details of an active instance.
    async fn extract_connection(
        &self,
        handle: &InstanceHandle,
    ) -> Result<VmConnectionInfo, ProvisionError>;

    async fn delete(&self, handle: &InstanceHandle) -> Result<(), ProvisionError>;
}

/// Registered adapters, keyed by provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn VmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind, replacing any previous one.
    pub fn with_provider(mut self, provider: Arc<dyn VmProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn VmProvider>, ProvisionError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or(ProvisionError::NoProvider(kind))
    }

    /// Adapter and full instance type for a GPU model and count.
    pub fn resolve(
        &self,
        gpu_name: &str,
        gpu_count: u32,
    ) -> Result<(Arc<dyn VmProvider>, String), ProvisionError> {
        let candidate = hardware::resolve(gpu_name)?;
        let provider = self.get(candidate.provider)?;
        Ok((provider, candidate.instance_type(gpu_count)))
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
