//! FleetBench Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/SSH
//! - Cloud provider APIs
//! - Runtime specifics
//!
//! Everything here describes *what* a benchmark run is made of: recipes,
//! tasks, execution groups, the hardware table and the planner that groups
//! tasks onto VMs.

pub mod error;
pub mod hardware;
pub mod ids;
pub mod planner;
pub mod recipe;
pub mod redact;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use hardware::{gpu_short_name, InstanceCandidate, ProviderKind};
pub use ids::{RunId, TaskId};
pub use planner::{GroupByModelAndGpu, Planner};
pub use recipe::{OverrideValue, Recipe, RecipeOverride, ServingEngine};
pub use redact::Redactor;
pub use status::{TaskStatus, VmState};
pub use task::{BenchmarkTask, ExecutionGroup, TaskOutcome};
