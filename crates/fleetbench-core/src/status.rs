//! Status enums for tasks and VMs.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CoreError;

/// Outcome status of a benchmark task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Deploy and benchmark both succeeded.
    Completed,
    /// Any step of the task failed, or the group never got a VM.
    Failed,
}

impl TaskStatus {
    /// Lower-case name as written to the manifest.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns true if the task completed.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a VM acquisition.
///
/// ```text
/// Requested -> Provisioning -> Active -> Ready -> Released
///     \             \             \
///      +-------------+-------------+--> Failed -> Released
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// Nothing has been sent to the provider yet.
    #[default]
    Requested,
    /// Create call accepted, waiting for the provider to report active.
    Provisioning,
    /// Provider reports active, waiting for SSH.
    Active,
    /// SSH reachable; the connection may be used.
    Ready,
    /// Provisioning or SSH readiness failed.
    Failed,
    /// VM deleted.
    Released,
}

impl VmState {
    /// Returns true if the transition `self -> next` is allowed.
    pub fn can_transition_to(&self, next: VmState) -> bool {
        use VmState::*;
        matches!(
            (*self, next),
            (Requested, Provisioning)
                | (Requested, Failed)
                | (Provisioning, Active)
                | (Provisioning, Failed)
                | (Active, Ready)
                | (Active, Failed)
                | (Ready, Released)
                | (Failed, Released)
        )
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(self, next: VmState) -> Result<VmState, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released)
    }

    /// Returns true if the connection may be used.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Released => "released",
        };
        f.write_str(name)
    }
}
