//! One-time host preparation and the system-info snapshot.

use std::time::Duration;

use tracing::{info, warn};

use fleetbench_remote::{RemoteTransport, SshTarget, TransportError};

const CHECK_TIMEOUT: Duration = Duration::from_secs(60);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
const SYSTEM_INFO_TIMEOUT: Duration = Duration::from_secs(120);

const INSTALL_DOCKER: &str = "curl -fsSL https://get.docker.com | sudo sh";

const INSTALL_NVIDIA_TOOLKIT: &str = concat!(
    "curl -fsSL https://nvidia.github.io/libnvidia-container/gpgkey",
    " | sudo gpg --dearmor -o /usr/share/keyrings/nvidia-container-toolkit-keyring.gpg",
    " && curl -s -L https://nvidia.github.io/libnvidia-container/stable/deb/nvidia-container-toolkit.list",
    " | sed 's#deb https://#deb [signed-by=/usr/share/keyrings/nvidia-container-toolkit-keyring.gpg] https://#g'",
    " | sudo tee /etc/apt/sources.list.d/nvidia-container-toolkit.list",
    " && sudo apt-get update",
    " && sudo apt-get install -y nvidia-container-toolkit",
    " && sudo nvidia-ctk runtime configure --runtime=docker",
    " && sudo systemctl restart docker",
);

const ADD_DOCKER_GROUP: &str = "sudo usermod -aG docker $USER";

/// Sectioned host description embedded in every result artifact.
pub const SYSTEM_INFO_SCRIPT: &str = r#"
echo "=== HOSTNAME ==="
hostname
echo ""
echo "=== OS ==="
cat /etc/os-release 2>/dev/null || echo "N/A"
echo ""
echo "=== KERNEL ==="
uname -r
echo ""
echo "=== CPU INFORMATION ==="
lscpu 2>/dev/null || echo "N/A"
echo ""
echo "=== CPU COUNT ==="
nproc 2>/dev/null || echo "N/A"
echo ""
echo "=== MEMORY ==="
free -h 2>/dev/null || echo "N/A"
echo ""
echo "=== GPU INFORMATION ==="
nvidia-smi --query-gpu=name,memory.total,driver_version,pstate,temperature.gpu,utilization.gpu --format=csv,noheader 2>/dev/null || echo "N/A"
echo ""
echo "=== GPU DETAILS ==="
nvidia-smi 2>/dev/null || echo "N/A"
echo ""
echo "=== DISK USAGE ==="
df -h 2>/dev/null || echo "N/A"
echo ""
echo "=== DOCKER VERSION ==="
docker --version 2>/dev/null || echo "N/A"
"#;

/// Make sure the container runtime and GPU toolkit are installed.
///
/// Each tool is only installed when `command -v` cannot find it. Failed
/// installs are logged, not returned: a broken host shows up as deploy
/// failures on its tasks.
pub async fn prepare_host(
    transport: &dyn RemoteTransport,
    target: &SshTarget,
) -> Result<(), TransportError> {
    info!(address = %target.address(), "Preparing host");
    ensure_tool(transport, target, "docker", INSTALL_DOCKER).await?;
    ensure_tool(transport, target, "nvidia-ctk", INSTALL_NVIDIA_TOOLKIT).await?;

    let out = transport
        .run_command(target, ADD_DOCKER_GROUP, CHECK_TIMEOUT)
        .await?;
    if !out.success() {
        warn!(exit_code = out.exit_code, stderr = %out.stderr.trim(), "Failed to add user to docker group");
    }
    Ok(())
}

async fn ensure_tool(
    transport: &dyn RemoteTransport,
    target: &SshTarget,
    tool: &str,
    install: &str,
) -> Result<(), TransportError> {
    let check = transport
        .run_command(target, &format!("command -v {}", tool), CHECK_TIMEOUT)
        .await?;
    if check.success() {
        return Ok(());
    }
    info!(tool, "Installing");
    let out = transport.run_command(target, install, INSTALL_TIMEOUT).await?;
    if !out.success() {
        warn!(tool, exit_code = out.exit_code, stderr = %out.stderr.trim(), "Install failed");
    }
    Ok(())
}

/// Collect [`SYSTEM_INFO_SCRIPT`] output; empty on failure.
pub async fn collect_system_info(transport: &dyn RemoteTransport, target: &SshTarget) -> String {
    match transport
        .run_command(target, SYSTEM_INFO_SCRIPT, SYSTEM_INFO_TIMEOUT)
        .await
    {
        Ok(out) if out.success() => out.stdout,
        Ok(out) => {
            warn!(exit_code = out.exit_code, "Failed to collect system info");
            String::new()
        }
        Err(e) => {
            warn!(error = %e, "Failed to collect system info");
            String::new()
        }
    }
}
