//! `fleetbench.toml` configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use fleetbench_provision::{CloudRiftConfig, GcpConfig};

use crate::ConfigError;

fn default_model_dir() -> String {
    "/hf_models".to_string()
}

fn default_bench_timeout() -> u64 {
    4 * 60 * 60
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BenchConfig {
    pub benchmark: BenchmarkSettings,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub mirror: MirrorSettings,
}

/// `[benchmark]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BenchmarkSettings {
    /// Base directory for run directories. Required.
    #[serde(default)]
    pub local_results_dir: Option<PathBuf>,
    /// Model weight cache on the benchmark host.
    #[serde(default = "default_model_dir")]
    pub model_dir: String,
    /// Ceiling for a single benchmark client invocation (seconds).
    #[serde(default = "default_bench_timeout")]
    pub bench_timeout_secs: u64,
}

/// `[providers.*]` sections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub cloudrift: CloudRiftConfig,
    pub gcp: GcpConfig,
}

/// `[mirror]` section: commit run results to the enclosing git repository.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MirrorSettings {
    pub enabled: bool,
    /// Push after every commit.
    pub push: bool,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            push: true,
        }
    }
}

impl BenchConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::parse(&content, path)
    }

    /// Parse config text; `source` is only used in error messages.
    pub fn parse(content: &str, source: &Path) -> Result<Self, ConfigError> {
        let config: BenchConfig = toml::from_str(content)
            .map_err(|e| ConfigError::Parse(source.to_path_buf(), e.to_string()))?;
        config.results_dir()?;
        Ok(config)
    }

    /// Base directory for run directories.
    pub fn results_dir(&self) -> Result<&Path, ConfigError> {
        self.benchmark
            .local_results_dir
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(ConfigError::Missing("benchmark.local_results_dir"))
    }
}
