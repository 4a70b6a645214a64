use super::{run_captured, stage_snapshot, ExecutionVerdict, Sandbox, SandboxSpec};
use crate::error::SandboxError;
use futures::future::BoxFuture;

#[cfg(windows)]
const SHELL: (&str, &str) = ("cmd", "/C");
#[cfg(not(windows))]
const SHELL: (&str, &str) = ("sh", "-c");

/// Runs each spec with the host shell inside a throwaway copy.
///
/// Same staging, timeout and cleanup contract as the container backend, but
/// no isolation and no network policy. For hosts without Docker.
#[derive(Debug, Default)]
pub struct ProcessSandbox;

impl ProcessSandbox {
    pub fn new() -> Self {
        Self
    }
}

impl Sandbox for ProcessSandbox {
    fn name(&self) -> &str {
        "process"
    }

    fn execute<'a>(
        &'a self,
        spec: &'a SandboxSpec,
    ) -> BoxFuture<'a, Result<ExecutionVerdict, SandboxError>> {
        Box::pin(async move {
            let staging = stage_snapshot(&spec.workspace_snapshot)?;
            if !spec.allow_network {
                tracing::debug!("Process sandbox cannot restrict network access");
            }

            let mut command = tokio::process::Command::new(SHELL.0);
            command
                .arg(SHELL.1)
                .arg(spec.shell_script())
                .current_dir(staging.path())
                .env("PYTHONDONTWRITEBYTECODE", "1");

            let result = run_captured(&mut command, spec.timeout)
                .await
                .map_err(|e| SandboxError::Unavailable(format!("failed to start shell: {}", e)));

            if let Err(e) = staging.close() {
                tracing::warn!(error = %e, "Failed to remove sandbox staging copy");
            }
            result
        })
    }
}
