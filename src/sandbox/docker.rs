use super::{run_captured, stage_snapshot, ExecutionVerdict, Sandbox, SandboxSpec};
use crate::config::SandboxConfig;
use crate::error::SandboxError;
use futures::future::BoxFuture;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

const CONTAINER_PREFIX: &str = "opsguard";
const WORKDIR: &str = "/app";

/// `docker create` may pull the image first.
const CREATE_TIMEOUT: Duration = Duration::from_secs(300);

/// Keep the container from writing root-owned caches into the staging copy.
const CONTAINER_ENV: &[(&str, &str)] = &[
    ("PYTHONDONTWRITEBYTECODE", "1"),
    ("PYTEST_ADDOPTS", "-p no:cacheprovider"),
];

/// Runs each spec in a fresh container from the pinned image.
pub struct DockerSandbox {
    config: SandboxConfig,
}

impl DockerSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn container_name(&self) -> String {
        format!("{}-{}", CONTAINER_PREFIX, Uuid::new_v4().simple())
    }

    fn resource_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref mem) = self.config.memory_limit {
            args.extend(["--memory".to_string(), mem.clone()]);
        }
        if let Some(cpus) = self.config.cpus {
            args.extend(["--cpus".to_string(), cpus.to_string()]);
        }
        args
    }

    fn create_args(&self, name: &str, staging: &Path, spec: &SandboxSpec) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), name.to_string()];

        if !spec.allow_network {
            args.push("--network=none".to_string());
        }
        args.extend(self.resource_args());
        for (key, value) in CONTAINER_ENV {
            args.extend(["-e".to_string(), format!("{}={}", key, value)]);
        }
        args.extend([
            "-v".to_string(),
            format!("{}:{}", staging.display(), WORKDIR),
            "-w".to_string(),
            WORKDIR.to_string(),
            self.config.image.clone(),
            "sh".to_string(),
            "-c".to_string(),
            spec.shell_script(),
        ]);
        args
    }

    async fn remove_container(name: &str) {
        let result = tokio::process::Command::new("docker")
            .args(["rm", "-f", name])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            tracing::warn!(container = name, error = %e, "Failed to remove container");
        }
    }

    fn start_args(name: &str) -> Vec<String> {
        vec!["start".to_string(), "-a".to_string(), name.to_string()]
    }

    /// `{{.State.Status}}` of the container, if docker can report it.
    async fn container_status(name: &str) -> Option<String> {
        let output = tokio::process::Command::new("docker")
            .args(["inspect", "--format", "{{.State.Status}}", name])
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Create the container, then attach to it for the program's run. Daemon
    /// and image problems surface from `create`, so the verdict of `start`
    /// belongs to the program under test.
    async fn run_in_container(
        &self,
        name: &str,
        staging: &Path,
        spec: &SandboxSpec,
    ) -> Result<ExecutionVerdict, SandboxError> {
        let mut create = tokio::process::Command::new("docker");
        create.args(self.create_args(name, staging, spec));
        let created = run_captured(&mut create, CREATE_TIMEOUT)
            .await
            .map_err(|e| SandboxError::Unavailable(format!("failed to start docker: {}", e)))?;
        check_created(&created)?;

        let mut start = tokio::process::Command::new("docker");
        start.args(Self::start_args(name));
        let verdict = run_captured(&mut start, spec.timeout)
            .await
            .map_err(|e| SandboxError::Unavailable(format!("failed to start docker: {}", e)))?;

        let never_ran = if verdict.passed() || verdict.timed_out {
            false
        } else {
            Self::container_status(name).await.as_deref() == Some("created")
        };
        check_started(verdict, never_ran)
    }
}

fn check_created(verdict: &ExecutionVerdict) -> Result<(), SandboxError> {
    if verdict.timed_out {
        return Err(SandboxError::Unavailable(format!(
            "docker create timed out after {}s",
            CREATE_TIMEOUT.as_secs()
        )));
    }
    if verdict.exit_code != 0 {
        return Err(SandboxError::Unavailable(format!(
            "docker create failed: {}",
            crate::util::truncate(verdict.stderr.trim(), 400)
        )));
    }
    Ok(())
}

/// A container still in the `created` state after `start` returned was never
/// started by the daemon; any other exit status is the program's own.
fn check_started(
    verdict: ExecutionVerdict,
    never_ran: bool,
) -> Result<ExecutionVerdict, SandboxError> {
    if never_ran {
        return Err(SandboxError::Unavailable(format!(
            "docker start failed: {}",
            crate::util::truncate(verdict.stderr.trim(), 400)
        )));
    }
    Ok(verdict)
}

impl Sandbox for DockerSandbox {
    fn name(&self) -> &str {
        "docker"
    }

    fn execute<'a>(
        &'a self,
        spec: &'a SandboxSpec,
    ) -> BoxFuture<'a, Result<ExecutionVerdict, SandboxError>> {
        Box::pin(async move {
            let staging = stage_snapshot(&spec.workspace_snapshot)?;
            let name = self.container_name();
            tracing::debug!(
                container = %name,
                image = %self.config.image,
                network = spec.allow_network,
                timeout_secs = spec.timeout.as_secs(),
                "Starting sandbox container"
            );

            let result = self.run_in_container(&name, staging.path(), spec).await;

            // Teardown runs on every path, including timeout and spawn errors.
            Self::remove_container(&name).await;
            if let Err(e) = staging.close() {
                tracing::warn!(error = %e, "Failed to remove sandbox staging copy");
            }

            if let Ok(ref verdict) = result {
                tracing::debug!(container = %name, verdict = %verdict.summary(), "Sandbox finished");
            }
            result
        })
    }
}
