//! FleetBench execution engine.
//!
//! Drives planned [`ExecutionGroup`](fleetbench_core::ExecutionGroup)s through
//! VM acquisition, host setup, per-task deploy/benchmark/teardown and VM
//! release, with a bounded number of groups in flight. Outcomes go to the
//! run's manifest through the [`ManifestRecorder`], optionally mirrored to a
//! git remote.
//!
//! Everything a run touches on disk lives under its run directory:
//!
//! ```text
//! {results}/{timestamp}_{hash8}/
//!     manifest.json
//!     benchmark.log
//!     instances.json             (only while VMs are alive)
//!     {recipe}/{variant}_benchmark.txt
//! ```

pub mod compose;
pub mod config;
pub mod deploy;
pub mod error;
pub mod executor;
pub mod logging;
pub mod mirror;
pub mod recorder;
pub mod run_dir;
pub mod setup;
pub mod summary;
pub mod teardown;
pub mod workload;

pub use config::{BenchConfig, BenchmarkSettings, MirrorSettings, ProvidersConfig};
pub use deploy::{DeployPlan, Deployer};
pub use error::{ConfigError, DeployError, EngineError, RecorderError};
pub use executor::{EngineSettings, GroupRunner};
pub use logging::RunLog;
pub use mirror::GitMirror;
pub use recorder::{Manifest, ManifestRecorder, OutcomeMirror};
pub use run_dir::{RunDir, MANIFEST_FILE, RUN_LOG_FILE};
pub use summary::RunSummary;
pub use teardown::{teardown_run, TeardownReport};
