//! Deployment descriptor rendering: `docker-compose.yaml` and `nginx.conf`.
//!
//! One engine service per instance. With a single instance the service
//! listens on 8000 and sees either every GPU or an explicit device slice.
//! With several instances, instance `i` gets a contiguous slice of
//! `gpus_per_instance` devices and host port `8000 + i`, and an nginx
//! `least_conn` proxy fronts them on 8080.

use std::fmt::Write;

use fleetbench_core::Recipe;

/// Port every engine container listens on.
pub const ENGINE_PORT: u16 = 8000;

/// Port of the load balancer in multi-instance deployments.
pub const PROXY_PORT: u16 = 8080;

/// Number of engine instances a recipe yields on `gpu_count` devices.
pub fn num_instances(recipe: &Recipe, gpu_count: u32) -> u32 {
    (gpu_count / recipe.engine.llm.gpus_per_instance()).max(1)
}

/// Host port clients should use.
pub fn service_port(instances: u32) -> u16 {
    if instances > 1 {
        PROXY_PORT
    } else {
        ENGINE_PORT
    }
}

/// Inputs for [`render_compose`].
#[derive(Debug, Clone)]
pub struct ComposeSpec<'a> {
    pub recipe: &'a Recipe,
    /// GPUs the task uses.
    pub gpu_count: u32,
    pub model_dir: &'a str,
    pub hf_token: &'a str,
    /// Restrict a single instance to these devices.
    pub device_ids: Option<&'a [u32]>,
}

fn quoted_ids(ids: impl IntoIterator<Item = u32>) -> String {
    ids.into_iter()
        .map(|id| format!("'{}'", id))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render `docker-compose.yaml`.
pub fn render_compose(spec: &ComposeSpec<'_>) -> String {
    let llm = &spec.recipe.engine.llm;
    let model = spec.recipe.model_name();
    let instances = num_instances(spec.recipe, spec.gpu_count);
    let per_instance = llm.gpus_per_instance();
    let args = llm.engine_args(model);

    let mut out = String::from("services:\n");
    for i in 0..instances {
        let (gpu_config, port) = if instances == 1 {
            let gpus = match spec.device_ids {
                Some(ids) => format!("device_ids: [{}]", quoted_ids(ids.iter().copied())),
                None => "count: all".to_string(),
            };
            (gpus, ENGINE_PORT)
        } else {
            let start = i * per_instance;
            (
                format!("device_ids: [{}]", quoted_ids(start..start + per_instance)),
                ENGINE_PORT + i as u16,
            )
        };

        let _ = write!(
            out,
            "\n  {engine}_{i}:\n    image: {image}\n    container_name: {engine}_{i}\n",
            engine = llm.engine(),
            image = llm.image(),
        );
        if let Some(entrypoint) = llm.entrypoint() {
            let _ = writeln!(out, "    entrypoint: {}", entrypoint);
        }
        let _ = write!(
            out,
            "    deploy:\n      resources:\n        reservations:\n          devices:\n            - driver: nvidia\n              {gpu_config}\n              capabilities: [gpu]\n"
        );
        let _ = write!(
            out,
            "    volumes:\n      - {dir}:{dir}\n    environment:\n      - HUGGING_FACE_HUB_TOKEN={token}\n      - HF_HOME={dir}\n",
            dir = spec.model_dir,
            token = spec.hf_token,
        );
        let _ = write!(
            out,
            "    ports:\n      - \"{port}:{ENGINE_PORT}\"\n    shm_size: '16gb'\n    ipc: host\n    command: >\n"
        );
        for arg in &args {
            let _ = writeln!(out, "      {}", arg);
        }
        let _ = write!(
            out,
            "    healthcheck:\n      test: [\"CMD\", \"bash\", \"-c\", \"curl -f http://localhost:{ENGINE_PORT}/health\"]\n      interval: 10s\n      timeout: 10s\n      retries: 180\n      start_period: 600s\n"
        );
    }

    if instances > 1 {
        let _ = write!(
            out,
            "\n  nginx:\n    image: nginx:alpine\n    container_name: nginx_lb\n    ports:\n      - \"{PROXY_PORT}:{PROXY_PORT}\"\n    volumes:\n      - ./nginx.conf:/etc/nginx/nginx.conf:ro\n    depends_on:\n"
        );
        for i in 0..instances {
            let _ = write!(
                out,
                "      {}_{}:\n        condition: service_healthy\n",
                llm.engine(),
                i
            );
        }
    }
    out
}

/// Render `nginx.conf` balancing over `instances` engine services.
pub fn render_nginx(recipe: &Recipe, instances: u32) -> String {
    let engine = recipe.engine.llm.engine();
    let upstream: String = (0..instances)
        .map(|i| format!("        server {}_{}:{};\n", engine, i, ENGINE_PORT))
        .collect();

    format!(
        r#"worker_processes auto;

events {{
    worker_connections 4096;
}}

http {{
    upstream engine_backend {{
        least_conn;
{upstream}    }}

    server {{
        listen {PROXY_PORT};

        location / {{
            proxy_pass http://engine_backend;
            proxy_http_version 1.1;
            proxy_set_header Connection "";
            proxy_set_header Host $host;
            proxy_set_header X-Real-IP $remote_addr;
            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
            proxy_set_header X-Forwarded-Proto $scheme;

            proxy_connect_timeout 600s;
            proxy_send_timeout 600s;
            proxy_read_timeout 600s;

            proxy_buffering off;
        }}
    }}
}}
"#
    )
}
