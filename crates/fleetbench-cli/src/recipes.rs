//! Recipe directories -> benchmark variants.
//!
//! `{recipe_dir}/recipe.toml` holds a base recipe plus `[[matrices]]`
//! entries of dotted keys. Scalars in an entry are broadcast to every
//! combination; lists are zipped and must all have the same length.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use fleetbench_core::{gpu_short_name, BenchmarkTask, CoreError, OverrideValue, Recipe, RecipeOverride};

pub const RECIPE_FILE: &str = "recipe.toml";

#[derive(Debug, Error)]
pub enum RecipeError {
    /// Recipe file could not be read.
    #[error("Failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),

    /// Recipe file is not valid TOML or does not match the recipe schema.
    #[error("Failed to parse {0}: {1}")]
    Parse(PathBuf, String),

    /// Lists in one matrix entry differ in length.
    #[error("All lists in a matrix entry of {path} must have the same length, got: {detail}")]
    MatrixLength { path: PathBuf, detail: String },

    /// Matrix value is not a scalar the recipe understands.
    #[error("Unsupported value for '{key}' in {path}")]
    UnsupportedValue { path: PathBuf, key: String },

    /// Merged recipe is invalid.
    #[error("{path}: {source}")]
    Invalid { path: PathBuf, source: CoreError },
}

/// One expanded matrix combination, not yet bound to a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipeVariant {
    pub recipe_dir: PathBuf,
    pub variant: String,
    pub recipe: Recipe,
    pub gpu_name: String,
    pub gpu_count: u32,
}

impl RecipeVariant {
    pub fn into_task(self, index: usize, run_dir: &Path) -> BenchmarkTask {
        BenchmarkTask::new(
            index,
            self.recipe_dir,
            self.variant,
            self.recipe,
            self.gpu_name,
            self.gpu_count,
            run_dir,
        )
    }
}

/// Expand every recipe directory, in argument order.
///
/// Directories without a recipe file or without matrices, and combinations
/// without `deploy.gpu`, are skipped with a warning.
pub fn enumerate(recipe_dirs: &[PathBuf]) -> Result<Vec<RecipeVariant>, RecipeError> {
    let mut variants = Vec::new();
    for dir in recipe_dirs {
        let path = dir.join(RECIPE_FILE);
        if !path.is_file() {
            warn!(recipe = %dir.display(), "No {} found, skipping", RECIPE_FILE);
            continue;
        }
        let text = std::fs::read_to_string(&path).map_err(|e| RecipeError::Io(path.clone(), e))?;
        variants.extend(expand_recipe(dir, &path, &text)?);
    }
    Ok(variants)
}

/// Base recipe of a single directory, matrices ignored.
pub fn load_recipe(dir: &Path) -> Result<Recipe, RecipeError> {
    let path = dir.join(RECIPE_FILE);
    let text = std::fs::read_to_string(&path).map_err(|e| RecipeError::Io(path.clone(), e))?;
    let (recipe, _) = parse_base(&path, &text)?;
    recipe.validate().map_err(|source| RecipeError::Invalid { path, source })?;
    Ok(recipe)
}

/// Split a recipe file into its base recipe and raw matrix entries.
fn parse_base(path: &Path, text: &str) -> Result<(Recipe, Vec<toml::Value>), RecipeError> {
    let mut raw: toml::Table =
        toml::from_str(text).map_err(|e| RecipeError::Parse(path.to_path_buf(), e.to_string()))?;
    let matrices = match raw.remove("matrices") {
        Some(toml::Value::Array(entries)) => entries,
        Some(_) => {
            return Err(RecipeError::Parse(
                path.to_path_buf(),
                "'matrices' must be an array of tables".to_string(),
            ))
        }
        None => Vec::new(),
    };
    let base: Recipe = toml::Value::Table(raw)
        .try_into()
        .map_err(|e: toml::de::Error| RecipeError::Parse(path.to_path_buf(), e.to_string()))?;
    Ok((base, matrices))
}

fn expand_recipe(dir: &Path, path: &Path, text: &str) -> Result<Vec<RecipeVariant>, RecipeError> {
    let (base, matrices) = parse_base(path, text)?;
    if matrices.is_empty() {
        warn!(recipe = %dir.display(), "No matrices, skipping");
        return Ok(Vec::new());
    }

    let mut variants = Vec::new();
    for entry in matrices {
        let toml::Value::Table(entry) = entry else {
            return Err(RecipeError::Parse(
                path.to_path_buf(),
                "matrix entries must be tables".to_string(),
            ));
        };
        let mut flat = BTreeMap::new();
        flatten("", entry, &mut flat);

        for combo in expand_entry(path, &flat)? {
            let mut ov = RecipeOverride::default();
            for (key, value) in &combo {
                ov.set(key, value).map_err(|source| RecipeError::Invalid {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            let recipe = base.apply(&ov);
            recipe.validate().map_err(|source| RecipeError::Invalid {
                path: path.to_path_buf(),
                source,
            })?;

            let Some(gpu_name) = recipe.deploy.gpu.clone() else {
                warn!(recipe = %dir.display(), "Matrix entry missing 'deploy.gpu', skipping");
                continue;
            };
            let gpu_count = recipe.deploy.gpu_count;
            variants.push(RecipeVariant {
                recipe_dir: dir.to_path_buf(),
                variant: variant_name(&gpu_name, gpu_count, &combo),
                recipe,
                gpu_name,
                gpu_count,
            });
        }
    }
    Ok(variants)
}

/// Nested tables -> dotted keys. Bare dotted TOML keys arrive nested.
fn flatten(prefix: &str, table: toml::Table, out: &mut BTreeMap<String, toml::Value>) {
    for (key, value) in table {
        let key = if prefix.is_empty() {
            key
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            toml::Value::Table(inner) => flatten(&key, inner, out),
            other => {
                out.insert(key, other);
            }
        }
    }
}

/// Broadcast + zip one flattened matrix entry.
fn expand_entry(
    path: &Path,
    entry: &BTreeMap<String, toml::Value>,
) -> Result<Vec<BTreeMap<String, OverrideValue>>, RecipeError> {
    let mut scalars = BTreeMap::new();
    let mut lists: Vec<(&String, &Vec<toml::Value>)> = Vec::new();
    for (key, value) in entry {
        match value {
            toml::Value::Array(items) => lists.push((key, items)),
            other => {
                scalars.insert(key.clone(), scalar(path, key, other)?);
            }
        }
    }

    let Some((_, first)) = lists.first() else {
        return Ok(vec![scalars]);
    };
    let n = first.len();
    if lists.iter().any(|(_, items)| items.len() != n) {
        let detail = lists
            .iter()
            .map(|(key, items)| format!("{}={}", key, items.len()))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(RecipeError::MatrixLength {
            path: path.to_path_buf(),
            detail,
        });
    }

    let mut combos = Vec::with_capacity(n);
    for i in 0..n {
        let mut combo = scalars.clone();
        for (key, items) in &lists {
            combo.insert((*key).clone(), scalar(path, key, &items[i])?);
        }
        combos.push(combo);
    }
    Ok(combos)
}

fn scalar(path: &Path, key: &str, value: &toml::Value) -> Result<OverrideValue, RecipeError> {
    match value {
        toml::Value::Integer(v) => Ok(OverrideValue::Integer(*v)),
        toml::Value::Float(v) => Ok(OverrideValue::Float(*v)),
        toml::Value::String(v) => Ok(OverrideValue::Text(v.clone())),
        _ => Err(RecipeError::UnsupportedValue {
            path: path.to_path_buf(),
            key: key.to_string(),
        }),
    }
}

/// `{gpu_short}x{count}`, then `_{abbrev}{value}` for each non-deploy key
/// in key order, e.g. `rtx5090x1_mc8_mcr8`.
pub fn variant_name(gpu_name: &str, gpu_count: u32, combo: &BTreeMap<String, OverrideValue>) -> String {
    let mut name = format!("{}x{}", gpu_short_name(gpu_name), gpu_count);
    for (key, value) in combo.iter().filter(|(k, _)| !k.starts_with("deploy.")) {
        let last = key.rsplit('.').next().unwrap_or(key);
        let abbrev: String = last.split('_').filter_map(|w| w.chars().next()).collect();
        name.push('_');
        name.push_str(&abbrev);
        name.push_str(&value.to_string());
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const RECIPE: &str = r#"
[model]
huggingface = "Qwen/Qwen3-8B"

[engine.llm]
max_concurrent_requests = 512

[engine.llm.vllm]
image = "vllm/vllm-openai:v0.11.0"

[[matrices]]
"deploy.gpu" = "NVIDIA GeForce RTX 5090"
"deploy.gpu_count" = 1
"benchmark.max_concurrency" = [8, 16]
"engine.llm.max_concurrent_requests" = [8, 16]

[[matrices]]
deploy.gpu = "NVIDIA H100 80GB"
deploy.gpu_count = [1, 2]
"#;

    fn expand(text: &str) -> Result<Vec<RecipeVariant>, RecipeError> {
        expand_recipe(Path::new("recipes/qwen3-8b"), Path::new("recipes/qwen3-8b/recipe.toml"), text)
    }

    #[test]
    fn test_broadcast_and_zip() {
        let variants = expand(RECIPE).unwrap();
        let names: Vec<_> = variants.iter().map(|v| v.variant.as_str()).collect();
        assert_eq!(
            names,
            vec!["rtx5090x1_mc8_mcr8", "rtx5090x1_mc16_mcr16", "h100x1", "h100x2"]
        );

        let first = &variants[0];
        assert_eq!(first.gpu_name, "NVIDIA GeForce RTX 5090");
        assert_eq!(first.recipe.benchmark.max_concurrency, 8);
        assert_eq!(first.recipe.engine.llm.max_concurrent_requests, Some(8));
        assert_eq!(first.recipe.engine.llm.image(), "vllm/vllm-openai:v0.11.0");

        // Unset keys keep the base recipe's values.
        assert_eq!(variants[2].recipe.engine.llm.max_concurrent_requests, Some(512));
        assert_eq!(variants[3].gpu_count, 2);
    }

    #[test]
    fn test_load_recipe_ignores_matrices() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(RECIPE_FILE), RECIPE).unwrap();
        let recipe = load_recipe(dir.path()).unwrap();
        assert_eq!(recipe.model.huggingface, "Qwen/Qwen3-8B");
        assert_eq!(recipe.deploy.gpu, None);
        assert_eq!(recipe.engine.llm.max_concurrent_requests, Some(512));

        let missing = tempdir().unwrap();
        assert!(matches!(load_recipe(missing.path()), Err(RecipeError::Io(..))));
    }

    #[test]
    fn test_mismatched_list_lengths() {
        let text = r#"
[model]
huggingface = "m/m"
[[matrices]]
"deploy.gpu" = "NVIDIA L40S"
"benchmark.max_concurrency" = [1, 2, 3]
"benchmark.num_prompts" = [10, 20]
"#;
        let err = expand(text).unwrap_err();
        match err {
            RecipeError::MatrixLength { detail, .. } => {
                assert_eq!(detail, "benchmark.max_concurrency=3, benchmark.num_prompts=2")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_entry_without_gpu_is_skipped() {
        let text = r#"
[model]
huggingface = "m/m"
[[matrices]]
"benchmark.max_concurrency" = 4
[[matrices]]
"deploy.gpu" = "NVIDIA L40S"
"#;
        let variants = expand(text).unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].variant, "l40sx1");
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let text = r#"
[model]
huggingface = "m/m"
[[matrices]]
"deploy.gpu" = "NVIDIA L40S"
"benchmark.warmup" = 3
"#;
        assert!(matches!(expand(text), Err(RecipeError::Invalid { .. })));
    }

    #[test]
    fn test_banned_extra_args_are_rejected() {
        let text = r#"
[model]
huggingface = "m/m"
[[matrices]]
"deploy.gpu" = "NVIDIA L40S"
"engine.llm.vllm.extra_args" = "--tensor-parallel-size 2"
"#;
        assert!(matches!(expand(text), Err(RecipeError::Invalid { .. })));
    }

    #[test]
    fn test_enumerate_keeps_directory_order() {
        let root = tempdir().unwrap();
        let a = root.path().join("qwen3-8b");
        let b = root.path().join("empty");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        std::fs::write(a.join(RECIPE_FILE), RECIPE).unwrap();

        let variants = enumerate(&[b, a.clone()]).unwrap();
        assert_eq!(variants.len(), 4);

        let run_dir = root.path().join("run");
        let task = variants[1].clone().into_task(1, &run_dir);
        assert_eq!(task.id().as_str(), "qwen3-8b/rtx5090x1_mc16_mcr16");
        assert_eq!(task.index, 1);
        assert_eq!(
            task.result_path(),
            run_dir.join("qwen3-8b").join("rtx5090x1_mc16_mcr16_benchmark.txt")
        );
    }
}
