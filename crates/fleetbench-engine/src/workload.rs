//! Benchmark client invocation and result artifacts.

use std::fmt::Write;
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use fleetbench_core::recipe::DEFAULT_VLLM_IMAGE;
use fleetbench_core::{BenchmarkTask, Recipe, Redactor, ServingEngine};
use fleetbench_remote::{RemoteTransport, SshTarget};

use crate::DeployError;

/// Start of the summary block printed by `vllm bench serve`.
pub const RESULTS_MARKER: &str = "============ Serving Benchmark Result ============";

/// Command line running `vllm bench serve` against the local endpoint.
///
/// The client always comes from a vLLM image; SGLang deployments use the
/// default vLLM image for it.
pub fn bench_command(recipe: &Recipe, port: u16) -> String {
    let llm = &recipe.engine.llm;
    let image = match llm.engine() {
        ServingEngine::Vllm => llm.image(),
        ServingEngine::Sglang => DEFAULT_VLLM_IMAGE,
    };
    let b = &recipe.benchmark;
    format!(
        "docker run --rm --network host --entrypoint bash {image} -c '\
         vllm bench serve --model {model} --base-url http://localhost:{port} \
         --max-concurrency {mc} --num-prompts {np} \
         --random-input-len {inp} --random-output-len {out}'",
        model = recipe.model_name(),
        mc = b.max_concurrency,
        np = b.num_prompts,
        inp = b.random_input_len,
        out = b.random_output_len,
    )
}

/// Input plus output length that does not fit the context window.
pub fn context_overflow(recipe: &Recipe) -> Option<(u32, u32)> {
    let ctx = recipe.engine.llm.context_length?;
    let total = recipe.benchmark.random_input_len + recipe.benchmark.random_output_len;
    (total >= ctx).then_some((total, ctx))
}

/// Results section of the client output; everything when the marker is absent.
pub fn extract_results(output: &str) -> &str {
    match output.find(RESULTS_MARKER) {
        Some(idx) => &output[idx..],
        None => output,
    }
}

/// Run the benchmark client once. Returns the command and its stdout.
pub async fn run_benchmark(
    transport: &dyn RemoteTransport,
    target: &SshTarget,
    recipe: &Recipe,
    port: u16,
    timeout: Duration,
) -> Result<(String, String), DeployError> {
    if let Some((total, ctx)) = context_overflow(recipe) {
        warn!(
            random_input_len = recipe.benchmark.random_input_len,
            random_output_len = recipe.benchmark.random_output_len,
            context_length = ctx,
            "Benchmark input + output length {} >= context length {}",
            total,
            ctx
        );
    }
    let command = bench_command(recipe, port);
    info!(
        max_concurrency = recipe.benchmark.max_concurrency,
        num_prompts = recipe.benchmark.num_prompts,
        "Running benchmark..."
    );
    let output = transport.run_command(target, &command, timeout).await?;
    if !output.success() {
        return Err(DeployError::Benchmark(output.exit_code));
    }
    Ok((command, output.stdout))
}

/// Pieces of a per-task result artifact.
#[derive(Debug, Clone, Copy)]
pub struct Artifact<'a> {
    pub task: &'a BenchmarkTask,
    pub compose: &'a str,
    pub bench_command: &'a str,
    pub system_info: &'a str,
    pub results: &'a str,
}

impl Artifact<'_> {
    /// Render the artifact with every secret masked.
    pub fn render(&self, redactor: &Redactor) -> String {
        let task = self.task;
        let mut out = String::new();
        let _ = writeln!(out, "=== TASK ===");
        let _ = writeln!(out, "task: {}", task.id());
        let _ = writeln!(out, "recipe: {}", task.recipe_dir.display());
        let _ = writeln!(out, "variant: {}", task.variant);
        let _ = writeln!(out, "model: {}", task.model_name());
        let _ = writeln!(out, "engine: {}", task.recipe.engine.llm.engine());
        let _ = writeln!(out, "gpu: {} x{}", task.gpu_name, task.gpu_count);
        let sections = [
            ("DOCKER COMPOSE", self.compose),
            ("BENCHMARK COMMAND", self.bench_command),
            ("SYSTEM INFO", self.system_info),
            ("BENCHMARK RESULTS", self.results),
        ];
        for (title, body) in sections {
            let _ = write!(out, "\n=== {} ===\n{}", title, body.trim_end());
            out.push('\n');
        }
        redactor.redact(&out).into_owned()
    }

    /// Render and write to `path`, creating parent directories.
    pub fn write(&self, path: &Path, redactor: &Redactor) -> Result<(), DeployError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DeployError::Artifact(path.to_path_buf(), e))?;
        }
        std::fs::write(path, self.render(redactor))
            .map_err(|e| DeployError::Artifact(path.to_path_buf(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbench_core::recipe::EngineImage;
    use tempfile::tempdir;

    fn recipe() -> Recipe {
        let mut recipe = Recipe::default();
        recipe.model.huggingface = "Qwen/Qwen3-8B".into();
        recipe.benchmark.max_concurrency = 8;
        recipe.benchmark.num_prompts = 80;
        recipe.benchmark.random_input_len = 4000;
        recipe.benchmark.random_output_len = 4000;
        recipe
    }

    #[test]
    fn test_bench_command() {
        let cmd = bench_command(&recipe(), 8080);
        assert_eq!(
            cmd,
            "docker run --rm --network host --entrypoint bash vllm/vllm-openai:latest -c '\
             vllm bench serve --model Qwen/Qwen3-8B --base-url http://localhost:8080 \
             --max-concurrency 8 --num-prompts 80 --random-input-len 4000 --random-output-len 4000'"
        );
    }

    #[test]
    fn test_sglang_uses_vllm_client_image() {
        let mut r = recipe();
        r.engine.llm.sglang = Some(EngineImage {
            image: "lmsysorg/sglang:v0.5".into(),
            extra_args: String::new(),
        });
        let cmd = bench_command(&r, 8000);
        assert!(cmd.contains(" vllm/vllm-openai:latest -c "));
        assert!(!cmd.contains("sglang"));
    }

    #[test]
    fn test_context_overflow() {
        let mut r = recipe();
        assert_eq!(context_overflow(&r), None);
        r.engine.llm.context_length = Some(8192);
        assert_eq!(context_overflow(&r), None);
        r.engine.llm.context_length = Some(8000);
        assert_eq!(context_overflow(&r), Some((8000, 8000)));
    }

    #[test]
    fn test_extract_results() {
        let output = format!("warmup...\nprogress\n{}\nSuccessful requests: 80\n", RESULTS_MARKER);
        assert!(extract_results(&output).starts_with(RESULTS_MARKER));
        assert_eq!(extract_results("no marker"), "no marker");
    }

    #[test]
    fn test_artifact_is_redacted() {
        let dir = tempdir().unwrap();
        let task = BenchmarkTask::new(
            3,
            "recipes/qwen3-8b",
            "h100x1_mc8",
            recipe(),
            "NVIDIA H100 80GB",
            1,
            dir.path(),
        );
        let artifact = Artifact {
            task: &task,
            compose: "environment:\n  - HUGGING_FACE_HUB_TOKEN=hf_secret_token\n",
            bench_command: "docker run ...",
            system_info: "=== HOSTNAME ===\nbox\n",
            results: "Successful requests: 80\n",
        };
        let redactor = Redactor::from_values(["hf_secret_token"]);
        artifact.write(&task.result_path(), &redactor).unwrap();

        let text = std::fs::read_to_string(task.result_path()).unwrap();
        assert!(text.starts_with("=== TASK ===\ntask: qwen3-8b/h100x1_mc8\n"));
        assert!(text.contains("HUGGING_FACE_HUB_TOKEN=***"));
        assert!(!text.contains("hf_secret_token"));
        assert!(text.contains("=== BENCHMARK RESULTS ===\nSuccessful requests: 80\n"));
        assert!(task.result_path().starts_with(dir.path().join("qwen3-8b")));
    }
}
