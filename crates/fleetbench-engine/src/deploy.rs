//! Remote deploy steps for one task, and the matching teardown.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use fleetbench_core::{BenchmarkTask, Recipe};
use fleetbench_remote::{CommandOutput, RemoteTransport, SshTarget};

use crate::compose::{num_instances, render_compose, render_nginx, service_port, ComposeSpec};
use crate::DeployError;

const SMOKE_PROMPT: &str = "What is 2+2? Answer with just the number.";

/// Everything needed to deploy one task.
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub compose: String,
    pub nginx: Option<String>,
    pub instances: u32,
    /// Host port clients talk to.
    pub port: u16,
    pub model_name: String,
    pub image: String,
    pub model_dir: String,
    pub hf_token: String,
}

impl DeployPlan {
    /// Plan a task on a VM provisioned with `group_gpu_count` devices.
    ///
    /// A task needing fewer devices than the VM has sees the contiguous slice
    /// `0..task.gpu_count`.
    pub fn for_task(
        task: &BenchmarkTask,
        group_gpu_count: u32,
        model_dir: &str,
        hf_token: &str,
    ) -> Self {
        let device_ids: Option<Vec<u32>> =
            (task.gpu_count < group_gpu_count).then(|| (0..task.gpu_count).collect());
        Self::build(
            &task.recipe,
            task.gpu_count,
            device_ids.as_deref(),
            model_dir,
            hf_token,
        )
    }

    /// Plan a standalone deployment that owns every device on the host.
    pub fn for_recipe(recipe: &Recipe, model_dir: &str, hf_token: &str) -> Self {
        Self::build(recipe, recipe.deploy.gpu_count, None, model_dir, hf_token)
    }

    fn build(
        recipe: &Recipe,
        gpu_count: u32,
        device_ids: Option<&[u32]>,
        model_dir: &str,
        hf_token: &str,
    ) -> Self {
        let instances = num_instances(recipe, gpu_count);
        let compose = render_compose(&ComposeSpec {
            recipe,
            gpu_count,
            model_dir,
            hf_token,
            device_ids,
        });
        Self {
            compose,
            nginx: (instances > 1).then(|| render_nginx(recipe, instances)),
            instances,
            port: service_port(instances),
            model_name: recipe.model_name().to_string(),
            image: recipe.engine.llm.image().to_string(),
            model_dir: model_dir.to_string(),
            hf_token: hf_token.to_string(),
        }
    }
}

/// Timeouts for each deploy step.
#[derive(Debug, Clone)]
pub struct DeployTimeouts {
    pub pull: Duration,
    pub download: Duration,
    pub up: Duration,
    pub health: Duration,
    pub health_interval: Duration,
    pub smoke: Duration,
    pub smoke_interval: Duration,
    pub down: Duration,
}

impl Default for DeployTimeouts {
    fn default() -> Self {
        Self {
            pull: Duration::from_secs(30 * 60),
            download: Duration::from_secs(60 * 60),
            up: Duration::from_secs(30 * 60),
            health: Duration::from_secs(30 * 60),
            health_interval: Duration::from_secs(10),
            smoke: Duration::from_secs(10 * 60),
            smoke_interval: Duration::from_secs(10),
            down: Duration::from_secs(5 * 60),
        }
    }
}

/// Runs deploy and teardown steps over a [`RemoteTransport`].
#[derive(Clone)]
pub struct Deployer {
    transport: Arc<dyn RemoteTransport>,
    timeouts: DeployTimeouts,
    dry_run: bool,
}

impl Deployer {
    pub fn new(transport: Arc<dyn RemoteTransport>) -> Self {
        Self {
            transport,
            timeouts: DeployTimeouts::default(),
            dry_run: false,
        }
    }

    pub fn with_timeouts(mut self, timeouts: DeployTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Skip the smoke test; a dry-run transport has no model to ask.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Upload descriptors, pull, download weights, start and verify.
    pub async fn deploy(&self, target: &SshTarget, plan: &DeployPlan) -> Result<(), DeployError> {
        self.transport
            .write_file(target, "docker-compose.yaml", &plan.compose)
            .await?;
        if let Some(nginx) = &plan.nginx {
            self.transport.write_file(target, "nginx.conf", nginx).await?;
        }

        info!("Pulling images...");
        self.step(target, "docker compose pull", "docker compose pull", self.timeouts.pull)
            .await?;

        info!(model = %plan.model_name, "Downloading model...");
        let download = format!(
            "docker run --rm -e HUGGING_FACE_HUB_TOKEN={token} -e HF_HOME={dir} -v {dir}:{dir} \
             --entrypoint bash {image} -c 'pip install huggingface_hub[cli,hf_transfer] && \
             HF_HUB_ENABLE_HF_TRANSFER=1 huggingface-cli download {model}'",
            token = plan.hf_token,
            dir = plan.model_dir,
            image = plan.image,
            model = plan.model_name,
        );
        self.step(target, "model download", &download, self.timeouts.download)
            .await?;

        info!("Cleaning up old containers...");
        if let Err(e) = self.step(target, "docker compose down", "docker compose down", self.timeouts.down).await {
            warn!(error = %e, "Pre-deploy cleanup failed");
        }

        info!(instances = plan.instances, "Starting services...");
        let up = format!(
            "docker compose up -d --wait --wait-timeout {}",
            self.timeouts.up.as_secs()
        );
        if let Err(e) = self.step(target, "docker compose up", &up, self.timeouts.up).await {
            self.dump_logs(target).await;
            return Err(e);
        }

        self.wait_healthy(target, plan.port).await?;
        info!(
            endpoint = %format!("http://{}:{}/v1", target.host, plan.port),
            model = %plan.model_name,
            instances = plan.instances,
            "Endpoint deployed"
        );

        if self.dry_run {
            info!("[dry-run] skip smoke test");
            return Ok(());
        }
        if let Err(e) = self.smoke_test(target, plan).await {
            self.dump_logs(target).await;
            return Err(e);
        }
        Ok(())
    }

    /// Stop the task's containers.
    pub async fn teardown(&self, target: &SshTarget) -> Result<(), DeployError> {
        info!("Tearing down...");
        self.step(target, "docker compose down", "docker compose down", self.timeouts.down)
            .await?;
        info!("Teardown complete.");
        Ok(())
    }

    async fn step(
        &self,
        target: &SshTarget,
        step: &'static str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, DeployError> {
        let output = self.transport.run_command(target, command, timeout).await?;
        if !output.success() {
            error!(
                step,
                exit_code = output.exit_code,
                stderr = %tail(&output.stderr, 20),
                "Deploy step failed"
            );
            return Err(DeployError::StepFailed {
                step,
                exit_code: output.exit_code,
            });
        }
        debug!(step, stdout = %tail(&output.stdout, 20), "Deploy step finished");
        Ok(output)
    }

    /// Poll the health endpoint until it answers or the ceiling passes.
    async fn wait_healthy(&self, target: &SshTarget, port: u16) -> Result<(), DeployError> {
        info!("Waiting for health check...");
        let command = format!("curl -sf http://localhost:{}/health", port);
        let interval = self.timeouts.health_interval;
        let deadline = Instant::now() + self.timeouts.health;
        loop {
            match self
                .transport
                .run_command(target, &command, Duration::from_secs(30))
                .await
            {
                Ok(out) if out.success() => return Ok(()),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Health probe failed"),
            }
            if Instant::now() + interval > deadline {
                error!(timeout_secs = self.timeouts.health.as_secs(), "Health check timed out");
                return Err(DeployError::HealthTimeout {
                    port,
                    timeout_secs: self.timeouts.health.as_secs(),
                });
            }
            sleep(interval).await;
        }
    }

    /// Ask a trivial question and check the answer, to catch broken models.
    ///
    /// Empty or malformed responses are retried (the server may still be
    /// warming up); a well-formed wrong answer fails immediately.
    async fn smoke_test(&self, target: &SshTarget, plan: &DeployPlan) -> Result<(), DeployError> {
        info!("Running smoke test...");
        let payload = json!({
            "model": plan.model_name,
            "messages": [{"role": "user", "content": SMOKE_PROMPT}],
            "max_tokens": 16,
        });
        let command = format!(
            "curl -s http://localhost:{}/v1/chat/completions -H 'Content-Type: application/json' -d '{}'",
            plan.port, payload
        );
        let interval = self.timeouts.smoke_interval;
        let deadline = Instant::now() + self.timeouts.smoke;
        loop {
            if let Ok(out) = self
                .transport
                .run_command(target, &command, Duration::from_secs(180))
                .await
            {
                if out.success() {
                    if let Some(answer) = chat_answer(&out.stdout) {
                        if answer.contains('4') {
                            info!("Smoke test passed.");
                            return Ok(());
                        }
                        error!(answer = %answer, "Smoke test failed: wrong answer");
                        return Err(DeployError::WrongAnswer(answer));
                    }
                }
            }
            if Instant::now() + interval > deadline {
                error!(timeout_secs = self.timeouts.smoke.as_secs(), "Smoke test timed out");
                return Err(DeployError::SmokeTimeout(self.timeouts.smoke.as_secs()));
            }
            sleep(interval).await;
        }
    }

    async fn dump_logs(&self, target: &SshTarget) {
        match self
            .transport
            .run_command(target, "docker compose logs --tail=100", Duration::from_secs(60))
            .await
        {
            Ok(out) => error!("Container logs:\n{}{}", out.stdout, out.stderr),
            Err(e) => warn!(error = %e, "Failed to fetch container logs"),
        }
    }
}

/// `choices[0].message.content` of a chat completion response.
fn chat_answer(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body.trim()).ok()?;
    value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Last `n` lines of command output.
fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}
