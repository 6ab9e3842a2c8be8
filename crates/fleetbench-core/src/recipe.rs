//! Strongly typed recipe and the field-by-field override applied per variant.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CoreError;

/// Default vLLM image.
pub const DEFAULT_VLLM_IMAGE: &str = "vllm/vllm-openai:latest";

/// Default SGLang image.
pub const DEFAULT_SGLANG_IMAGE: &str = "lmsysorg/sglang:latest";

/// Flags always emitted by the deployment descriptor itself.
const HARDCODED_FLAGS: &[&str] = &[
    "--trust-remote-code",
    "--host",
    "--port",
    "--model",
    "--model-path",
    "--served-model-name",
];

/// A fully resolved serving configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recipe {
    pub model: ModelSpec,
    pub engine: EngineSpec,
    pub benchmark: BenchmarkParams,
    pub deploy: DeploySpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    /// Hugging Face model id, e.g. `Qwen/Qwen3-8B`.
    pub huggingface: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSpec {
    pub llm: LlmSpec,
}

/// Engine-agnostic serving parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSpec {
    pub context_length: Option<u32>,
    pub max_concurrent_requests: Option<u32>,
    pub tensor_parallel_size: u32,
    pub pipeline_parallel_size: u32,
    pub gpu_memory_utilization: f64,
    pub vllm: Option<EngineImage>,
    pub sglang: Option<EngineImage>,
}

impl Default for LlmSpec {
    fn default() -> Self {
        Self {
            context_length: None,
            max_concurrent_requests: None,
            tensor_parallel_size: 1,
            pipeline_parallel_size: 1,
            gpu_memory_utilization: 0.9,
            vllm: None,
            sglang: None,
        }
    }
}

/// Engine-specific image and free-form flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineImage {
    pub image: String,
    #[serde(default)]
    pub extra_args: String,
}

/// Benchmark workload parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkParams {
    pub max_concurrency: u32,
    pub num_prompts: u32,
    pub random_input_len: u32,
    pub random_output_len: u32,
}

impl Default for BenchmarkParams {
    fn default() -> Self {
        Self {
            max_concurrency: 128,
            num_prompts: 256,
            random_input_len: 8000,
            random_output_len: 8000,
        }
    }
}

/// Target hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySpec {
    pub gpu: Option<String>,
    pub gpu_count: u32,
}

impl Default for DeploySpec {
    fn default() -> Self {
        Self {
            gpu: None,
            gpu_count: 1,
        }
    }
}

/// Serving engine selected by a recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServingEngine {
    Vllm,
    Sglang,
}

impl ServingEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vllm => "vllm",
            Self::Sglang => "sglang",
        }
    }

    fn tensor_parallel_flag(&self) -> &'static str {
        match self {
            Self::Vllm => "--tensor-parallel-size",
            Self::Sglang => "--tp",
        }
    }

    fn pipeline_parallel_flag(&self) -> &'static str {
        match self {
            Self::Vllm => "--pipeline-parallel-size",
            Self::Sglang => "--dp",
        }
    }

    fn memory_flag(&self) -> &'static str {
        match self {
            Self::Vllm => "--gpu-memory-utilization",
            Self::Sglang => "--mem-fraction-static",
        }
    }

    fn context_length_flag(&self) -> &'static str {
        match self {
            Self::Vllm => "--max-model-len",
            Self::Sglang => "--context-length",
        }
    }

    fn max_requests_flag(&self) -> &'static str {
        match self {
            Self::Vllm => "--max-num-seqs",
            Self::Sglang => "--max-running-requests",
        }
    }

    /// Flags that must not appear in `extra_args`.
    pub fn banned_extra_flags(&self) -> Vec<&'static str> {
        let mut flags = vec![
            self.tensor_parallel_flag(),
            self.pipeline_parallel_flag(),
            self.memory_flag(),
            self.context_length_flag(),
            self.max_requests_flag(),
        ];
        flags.extend_from_slice(HARDCODED_FLAGS);
        flags
    }
}

impl fmt::Display for ServingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LlmSpec {
    /// Active engine: SGLang when configured, vLLM otherwise.
    pub fn engine(&self) -> ServingEngine {
        if self.sglang.is_some() {
            ServingEngine::Sglang
        } else {
            ServingEngine::Vllm
        }
    }

    /// Container image for the active engine.
    pub fn image(&self) -> &str {
        match (&self.sglang, &self.vllm) {
            (Some(sglang), _) => &sglang.image,
            (None, Some(vllm)) => &vllm.image,
            (None, None) => DEFAULT_VLLM_IMAGE,
        }
    }

    /// Extra CLI flags for the active engine.
    pub fn extra_args(&self) -> &str {
        match (&self.sglang, &self.vllm) {
            (Some(sglang), _) => &sglang.extra_args,
            (None, Some(vllm)) => &vllm.extra_args,
            (None, None) => "",
        }
    }

    /// Entrypoint override; SGLang images ship without one.
    pub fn entrypoint(&self) -> Option<&'static str> {
        match self.engine() {
            ServingEngine::Sglang => Some("python3 -m sglang.launch_server"),
            ServingEngine::Vllm => None,
        }
    }

    /// Number of GPUs one engine instance consumes.
    pub fn gpus_per_instance(&self) -> u32 {
        (self.tensor_parallel_size * self.pipeline_parallel_size).max(1)
    }

    /// Engine command-line arguments, one flag (with value) per element.
    pub fn engine_args(&self, model_name: &str) -> Vec<String> {
        let engine = self.engine();
        let mut args = vec!["--trust-remote-code".to_string()];
        args.push(match engine {
            ServingEngine::Vllm => format!(
                "{}={}",
                engine.memory_flag(),
                self.gpu_memory_utilization
            ),
            ServingEngine::Sglang => format!(
                "{} {}",
                engine.memory_flag(),
                self.gpu_memory_utilization
            ),
        });
        args.push("--host 0.0.0.0".to_string());
        args.push("--port 8000".to_string());
        args.push(format!(
            "{} {}",
            engine.tensor_parallel_flag(),
            self.tensor_parallel_size
        ));
        args.push(format!(
            "{} {}",
            engine.pipeline_parallel_flag(),
            self.pipeline_parallel_size
        ));
        args.push(match engine {
            ServingEngine::Vllm => format!("--model {}", model_name),
            ServingEngine::Sglang => format!("--model-path {}", model_name),
        });
        args.push(format!("--served-model-name {}", model_name));

        if let Some(len) = self.context_length {
            args.push(format!("{} {}", engine.context_length_flag(), len));
        }
        if let Some(max) = self.max_concurrent_requests {
            args.push(format!("{} {}", engine.max_requests_flag(), max));
        }

        let extra = self.extra_args().trim();
        if !extra.is_empty() {
            args.push(extra.to_string());
        }
        args
    }
}

impl Recipe {
    /// Hugging Face model id.
    pub fn model_name(&self) -> &str {
        &self.model.huggingface
    }

    /// Apply an override, returning the merged recipe.
    ///
    /// Only fields set in the override change; engine sections are created
    /// with default images when an override targets an engine the base
    /// recipe does not configure.
    pub fn apply(&self, ov: &RecipeOverride) -> Recipe {
        let mut merged = self.clone();

        if let Some(model) = &ov.model_huggingface {
            merged.model.huggingface = model.clone();
        }

        let llm = &mut merged.engine.llm;
        if let Some(v) = ov.context_length {
            llm.context_length = Some(v);
        }
        if let Some(v) = ov.max_concurrent_requests {
            llm.max_concurrent_requests = Some(v);
        }
        if let Some(v) = ov.tensor_parallel_size {
            llm.tensor_parallel_size = v;
        }
        if let Some(v) = ov.pipeline_parallel_size {
            llm.pipeline_parallel_size = v;
        }
        if let Some(v) = ov.gpu_memory_utilization {
            llm.gpu_memory_utilization = v;
        }
        if ov.vllm_image.is_some() || ov.vllm_extra_args.is_some() {
            let vllm = llm.vllm.get_or_insert_with(|| EngineImage {
                image: DEFAULT_VLLM_IMAGE.to_string(),
                extra_args: String::new(),
            });
            if let Some(image) = &ov.vllm_image {
                vllm.image = image.clone();
            }
            if let Some(extra) = &ov.vllm_extra_args {
                vllm.extra_args = extra.clone();
            }
        }
        if ov.sglang_image.is_some() || ov.sglang_extra_args.is_some() {
            let sglang = llm.sglang.get_or_insert_with(|| EngineImage {
                image: DEFAULT_SGLANG_IMAGE.to_string(),
                extra_args: String::new(),
            });
            if let Some(image) = &ov.sglang_image {
                sglang.image = image.clone();
            }
            if let Some(extra) = &ov.sglang_extra_args {
                sglang.extra_args = extra.clone();
            }
        }

        let bench = &mut merged.benchmark;
        if let Some(v) = ov.max_concurrency {
            bench.max_concurrency = v;
        }
        if let Some(v) = ov.num_prompts {
            bench.num_prompts = v;
        }
        if let Some(v) = ov.random_input_len {
            bench.random_input_len = v;
        }
        if let Some(v) = ov.random_output_len {
            bench.random_output_len = v;
        }

        if let Some(gpu) = &ov.gpu {
            merged.deploy.gpu = Some(gpu.clone());
        }
        if let Some(count) = ov.gpu_count {
            merged.deploy.gpu_count = count;
        }

        merged
    }

    /// Check invariants a runnable recipe must satisfy.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.model.huggingface.trim().is_empty() {
            return Err(CoreError::InvalidRecipe(
                "model.huggingface is required".to_string(),
            ));
        }
        if self.deploy.gpu_count == 0 {
            return Err(CoreError::InvalidRecipe(
                "deploy.gpu_count must be at least 1".to_string(),
            ));
        }
        let llm = &self.engine.llm;
        if llm.tensor_parallel_size == 0 || llm.pipeline_parallel_size == 0 {
            return Err(CoreError::InvalidRecipe(
                "parallelism sizes must be at least 1".to_string(),
            ));
        }

        let banned = llm.engine().banned_extra_flags();
        let mut found: Vec<&str> = llm
            .extra_args()
            .split_whitespace()
            .filter_map(|token| token.split('=').next())
            .filter(|flag| banned.contains(flag))
            .collect();
        if !found.is_empty() {
            found.sort_unstable();
            found.dedup();
            return Err(CoreError::InvalidRecipe(format!(
                "extra_args contains flags managed by named fields: {}",
                found.join(", ")
            )));
        }
        Ok(())
    }
}

/// Scalar value of a dotted override key.
#[derive(Debug, Clone, PartialEq)]
pub enum OverrideValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for OverrideValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl OverrideValue {
    fn as_u32(&self, key: &str) -> Result<u32, CoreError> {
        match self {
            Self::Integer(v) => u32::try_from(*v).map_err(|_| CoreError::InvalidRecipeValue {
                key: key.to_string(),
                expected: "a non-negative integer",
            }),
            _ => Err(CoreError::InvalidRecipeValue {
                key: key.to_string(),
                expected: "a non-negative integer",
            }),
        }
    }

    fn as_f64(&self, key: &str) -> Result<f64, CoreError> {
        match self {
            Self::Float(v) => Ok(*v),
            Self::Integer(v) => Ok(*v as f64),
            Self::Text(_) => Err(CoreError::InvalidRecipeValue {
                key: key.to_string(),
                expected: "a number",
            }),
        }
    }

    fn as_text(&self, key: &str) -> Result<String, CoreError> {
        match self {
            Self::Text(v) => Ok(v.clone()),
            _ => Err(CoreError::InvalidRecipeValue {
                key: key.to_string(),
                expected: "a string",
            }),
        }
    }
}

/// Per-variant override. Every field is optional; unset fields keep the
/// base recipe's value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecipeOverride {
    pub model_huggingface: Option<String>,
    pub context_length: Option<u32>,
    pub max_concurrent_requests: Option<u32>,
    pub tensor_parallel_size: Option<u32>,
    pub pipeline_parallel_size: Option<u32>,
    pub gpu_memory_utilization: Option<f64>,
    pub vllm_image: Option<String>,
    pub vllm_extra_args: Option<String>,
    pub sglang_image: Option<String>,
    pub sglang_extra_args: Option<String>,
    pub max_concurrency: Option<u32>,
    pub num_prompts: Option<u32>,
    pub random_input_len: Option<u32>,
    pub random_output_len: Option<u32>,
    pub gpu: Option<String>,
    pub gpu_count: Option<u32>,
}

impl RecipeOverride {
    /// Set a field by its dotted recipe key, e.g. `benchmark.max_concurrency`.
    pub fn set(&mut self, key: &str, value: &OverrideValue) -> Result<(), CoreError> {
        match key {
            "model.huggingface" => self.model_huggingface = Some(value.as_text(key)?),
            "engine.llm.context_length" => self.context_length = Some(value.as_u32(key)?),
            "engine.llm.max_concurrent_requests" => {
                self.max_concurrent_requests = Some(value.as_u32(key)?)
            }
            "engine.llm.tensor_parallel_size" => {
                self.tensor_parallel_size = Some(value.as_u32(key)?)
            }
            "engine.llm.pipeline_parallel_size" => {
                self.pipeline_parallel_size = Some(value.as_u32(key)?)
            }
            "engine.llm.gpu_memory_utilization" => {
                self.gpu_memory_utilization = Some(value.as_f64(key)?)
            }
            "engine.llm.vllm.image" => self.vllm_image = Some(value.as_text(key)?),
            "engine.llm.vllm.extra_args" => self.vllm_extra_args = Some(value.as_text(key)?),
            "engine.llm.sglang.image" => self.sglang_image = Some(value.as_text(key)?),
            "engine.llm.sglang.extra_args" => self.sglang_extra_args = Some(value.as_text(key)?),
            "benchmark.max_concurrency" => self.max_concurrency = Some(value.as_u32(key)?),
            "benchmark.num_prompts" => self.num_prompts = Some(value.as_u32(key)?),
            "benchmark.random_input_len" => self.random_input_len = Some(value.as_u32(key)?),
            "benchmark.random_output_len" => self.random_output_len = Some(value.as_u32(key)?),
            "deploy.gpu" => self.gpu = Some(value.as_text(key)?),
            "deploy.gpu_count" => self.gpu_count = Some(value.as_u32(key)?),
            other => return Err(CoreError::UnknownRecipeKey(other.to_string())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Recipe {
        let mut recipe = Recipe::default();
        recipe.model.huggingface = "Qwen/Qwen3-8B".to_string();
        recipe.deploy.gpu = Some("NVIDIA GeForce RTX 5090".to_string());
        recipe
    }

    #[test]
    fn test_defaults() {
        let recipe = Recipe::default();
        assert_eq!(recipe.benchmark.max_concurrency, 128);
        assert_eq!(recipe.benchmark.num_prompts, 256);
        assert_eq!(recipe.engine.llm.tensor_parallel_size, 1);
        assert_eq!(recipe.engine.llm.image(), DEFAULT_VLLM_IMAGE);
        assert_eq!(recipe.deploy.gpu_count, 1);
    }

    #[test]
    fn test_apply_only_touches_set_fields() {
        let ov = RecipeOverride {
            max_concurrency: Some(8),
            gpu_count: Some(4),
            ..Default::default()
        };
        let merged = base().apply(&ov);
        assert_eq!(merged.benchmark.max_concurrency, 8);
        assert_eq!(merged.deploy.gpu_count, 4);
        assert_eq!(merged.benchmark.num_prompts, 256);
        assert_eq!(merged.model_name(), "Qwen/Qwen3-8B");
    }

    #[test]
    fn test_apply_creates_engine_section() {
        let ov = RecipeOverride {
            sglang_extra_args: Some("--enable-torch-compile".to_string()),
            ..Default::default()
        };
        let merged = base().apply(&ov);
        assert_eq!(merged.engine.llm.engine(), ServingEngine::Sglang);
        assert_eq!(merged.engine.llm.image(), DEFAULT_SGLANG_IMAGE);
        assert_eq!(merged.engine.llm.extra_args(), "--enable-torch-compile");
    }

    #[test]
    fn test_set_dotted_keys() {
        let mut ov = RecipeOverride::default();
        ov.set("engine.llm.max_concurrent_requests", &OverrideValue::Integer(256))
            .unwrap();
        ov.set("deploy.gpu", &OverrideValue::Text("NVIDIA H100 80GB".into()))
            .unwrap();
        ov.set("engine.llm.gpu_memory_utilization", &OverrideValue::Integer(1))
            .unwrap();
        assert_eq!(ov.max_concurrent_requests, Some(256));
        assert_eq!(ov.gpu.as_deref(), Some("NVIDIA H100 80GB"));
        assert_eq!(ov.gpu_memory_utilization, Some(1.0));
    }

    #[test]
    fn test_set_rejects_unknown_and_mistyped() {
        let mut ov = RecipeOverride::default();
        assert!(matches!(
            ov.set("engine.llm.bogus", &OverrideValue::Integer(1)),
            Err(CoreError::UnknownRecipeKey(_))
        ));
        assert!(matches!(
            ov.set("benchmark.num_prompts", &OverrideValue::Text("many".into())),
            Err(CoreError::InvalidRecipeValue { .. })
        ));
        assert!(ov
            .set("benchmark.num_prompts", &OverrideValue::Integer(-1))
            .is_err());
    }

    #[test]
    fn test_validate_rejects_managed_flags() {
        let mut recipe = base();
        recipe.engine.llm.vllm = Some(EngineImage {
            image: DEFAULT_VLLM_IMAGE.to_string(),
            extra_args: "--max-model-len=4096 --enforce-eager".to_string(),
        });
        let err = recipe.validate().unwrap_err();
        assert!(err.to_string().contains("--max-model-len"));
    }

    #[test]
    fn test_validate_requires_model() {
        let recipe = Recipe::default();
        assert!(recipe.validate().is_err());
        assert!(base().validate().is_ok());
    }

    #[test]
    fn test_vllm_engine_args() {
        let mut recipe = base();
        recipe.engine.llm.context_length = Some(16384);
        let args = recipe.engine.llm.engine_args("Qwen/Qwen3-8B");
        assert!(args.contains(&"--gpu-memory-utilization=0.9".to_string()));
        assert!(args.contains(&"--tensor-parallel-size 1".to_string()));
        assert!(args.contains(&"--model Qwen/Qwen3-8B".to_string()));
        assert!(args.contains(&"--max-model-len 16384".to_string()));
    }

    #[test]
    fn test_sglang_engine_args() {
        let mut recipe = base();
        recipe.engine.llm.sglang = Some(EngineImage {
            image: DEFAULT_SGLANG_IMAGE.to_string(),
            extra_args: String::new(),
        });
        recipe.engine.llm.max_concurrent_requests = Some(64);
        let args = recipe.engine.llm.engine_args("m");
        assert!(args.contains(&"--mem-fraction-static 0.9".to_string()));
        assert!(args.contains(&"--tp 1".to_string()));
        assert!(args.contains(&"--model-path m".to_string()));
        assert!(args.contains(&"--max-running-requests 64".to_string()));
        assert_eq!(
            recipe.engine.llm.entrypoint(),
            Some("python3 -m sglang.launch_server")
        );
    }
}
