//! Benchmark tasks, execution groups and task outcomes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::hardware::gpu_short_name;
use crate::{Recipe, TaskId, TaskStatus};

/// One resolved (recipe, variant) pair to execute.
///
/// Built once during enumeration and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkTask {
    /// Position in the enumerated task list (submission order).
    pub index: usize,

    /// Recipe name (last component of the recipe directory).
    pub recipe_name: String,

    /// Directory the recipe was loaded from.
    pub recipe_dir: PathBuf,

    /// Human-readable variant label.
    pub variant: String,

    /// Fully resolved serving configuration.
    pub recipe: Recipe,

    /// Target GPU model name.
    pub gpu_name: String,

    /// GPUs required by this task.
    pub gpu_count: u32,

    /// Run directory that owns this task's artifacts.
    pub run_dir: PathBuf,
}

impl BenchmarkTask {
    /// Create a task from a resolved recipe.
    pub fn new(
        index: usize,
        recipe_dir: impl Into<PathBuf>,
        variant: impl Into<String>,
        recipe: Recipe,
        gpu_name: impl Into<String>,
        gpu_count: u32,
        run_dir: impl Into<PathBuf>,
    ) -> Self {
        let recipe_dir = recipe_dir.into();
        let recipe_name = recipe_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| recipe_dir.display().to_string());
        Self {
            index,
            recipe_name,
            recipe_dir,
            variant: variant.into(),
            recipe,
            gpu_name: gpu_name.into(),
            gpu_count,
            run_dir: run_dir.into(),
        }
    }

    /// Task identity, `{recipe}/{variant}`.
    pub fn id(&self) -> TaskId {
        TaskId::for_variant(&self.recipe_name, &self.variant)
    }

    pub fn model_name(&self) -> &str {
        self.recipe.model_name()
    }

    pub fn gpu_short(&self) -> String {
        gpu_short_name(&self.gpu_name)
    }

    /// Result artifact path relative to the run directory.
    pub fn result_file(&self) -> PathBuf {
        Path::new(&self.recipe_name).join(format!("{}_benchmark.txt", self.variant))
    }

    /// Absolute result artifact path.
    pub fn result_path(&self) -> PathBuf {
        self.run_dir.join(self.result_file())
    }
}

/// A set of tasks sharing one VM.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionGroup {
    /// GPU model name shared by every member.
    pub gpu_name: String,

    /// GPUs provisioned for the group (max over members).
    pub gpu_count: u32,

    /// Members in execution order.
    pub tasks: Vec<BenchmarkTask>,

    /// Sub-group number when a (model, GPU) group was split across VMs.
    pub split_index: Option<usize>,
}

impl ExecutionGroup {
    /// Short label used in logs and VM names, e.g. `rtx5090x4-qwen3-8b`.
    pub fn label(&self) -> String {
        let model = self
            .tasks
            .first()
            .map(|t| slug(t.model_name()))
            .unwrap_or_default();
        let mut label = format!("{}x{}", gpu_short_name(&self.gpu_name), self.gpu_count);
        if !model.is_empty() {
            label.push('-');
            label.push_str(&model);
        }
        if let Some(idx) = self.split_index {
            label.push_str(&format!("-{}", idx));
        }
        label
    }

    pub fn model_name(&self) -> Option<&str> {
        self.tasks.first().map(|t| t.model_name())
    }
}

/// Last path segment of a model id, lower-cased, non-alphanumerics as `-`.
fn slug(model: &str) -> String {
    let last = model.rsplit('/').next().unwrap_or(model);
    let mut out = String::with_capacity(last.len());
    for c in last.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Outcome of one task attempt, as appended to the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// `{recipe}/{variant}`.
    pub task_id: TaskId,

    /// Submission index; manifest entries are kept in this order.
    pub index: usize,

    pub recipe: String,
    pub variant: String,
    pub gpu_name: String,
    pub gpu_short: String,
    pub gpu_count: u32,
    pub model_name: String,

    /// Result artifact, relative to the run directory.
    pub result_file: PathBuf,

    pub status: TaskStatus,
}

impl TaskOutcome {
    pub fn new(task: &BenchmarkTask, status: TaskStatus) -> Self {
        Self {
            task_id: task.id(),
            index: task.index,
            recipe: task.recipe_name.clone(),
            variant: task.variant.clone(),
            gpu_name: task.gpu_name.clone(),
            gpu_short: task.gpu_short(),
            gpu_count: task.gpu_count,
            model_name: task.model_name().to_string(),
            result_file: task.result_file(),
            status,
        }
    }

    pub fn completed(task: &BenchmarkTask) -> Self {
        Self::new(task, TaskStatus::Completed)
    }

    pub fn failed(task: &BenchmarkTask) -> Self {
        Self::new(task, TaskStatus::Failed)
    }
}
