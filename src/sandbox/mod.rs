//! Sandbox executor
//!
//! Every call stages a private copy of the snapshot, runs one command in a
//! disposable environment and tears that environment down before returning.
//! The caller's workspace is never mounted or touched.

pub mod docker;
pub mod process;

pub use docker::DockerSandbox;
pub use process::ProcessSandbox;

use crate::config::{SandboxBackend, SandboxConfig};
use crate::error::SandboxError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Per-stream capture cap. The tail is kept.
const MAX_CAPTURE_BYTES: usize = 256 * 1024;

/// How long to wait for pipe readers after the process is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Exit code reported for runs killed by the wall-clock timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const STAGING_PREFIX: &str = "opsguard-sbx-";

/// Input to one sandbox call. Built per call by the orchestrator.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub workspace_snapshot: PathBuf,
    pub command: String,
    pub timeout: Duration,
    pub extra_setup_commands: Vec<String>,
    pub allow_network: bool,
}

impl SandboxSpec {
    pub fn new(workspace_snapshot: &Path, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            workspace_snapshot: workspace_snapshot.to_path_buf(),
            command: command.into(),
            timeout,
            extra_setup_commands: Vec::new(),
            allow_network: false,
        }
    }

    pub fn with_setup(mut self, commands: Vec<String>) -> Self {
        self.extra_setup_commands = commands;
        self
    }

    pub fn with_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }

    /// Setup commands and the main command chained with `&&`.
    pub fn shell_script(&self) -> String {
        self.extra_setup_commands
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.command.as_str()))
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

/// Result of one sandboxed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionVerdict {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecutionVerdict {
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Text that explains a failure. Test runners report failures on stdout,
    /// so stdout stands in when stderr is empty.
    pub fn diagnostics(&self) -> &str {
        if self.stderr.trim().is_empty() && !self.passed() {
            &self.stdout
        } else {
            &self.stderr
        }
    }

    /// One-line summary for logs and the event trail.
    pub fn summary(&self) -> String {
        let mut summary = format!("exit={}", self.exit_code);
        if self.timed_out {
            summary.push_str(" timed_out");
        }
        let last = crate::util::last_line(self.diagnostics());
        if !last.is_empty() {
            summary.push_str(": ");
            summary.push_str(&crate::util::truncate(last, 160));
        }
        summary
    }
}

/// Execution backend. One call, one verdict, environment destroyed.
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &str;

    fn execute<'a>(
        &'a self,
        spec: &'a SandboxSpec,
    ) -> BoxFuture<'a, Result<ExecutionVerdict, SandboxError>>;
}

pub fn create_sandbox(config: &SandboxConfig) -> Arc<dyn Sandbox> {
    match config.backend {
        SandboxBackend::Docker => Arc::new(DockerSandbox::new(config.clone())),
        SandboxBackend::Process => Arc::new(ProcessSandbox::new()),
    }
}

/// What the sandbox verifies against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationMode {
    /// Run the entry file with the interpreter.
    Entry,
    /// Install pytest and run the suite.
    Pytest { tests_dir: PathBuf },
}

impl VerificationMode {
    pub fn command(&self, entry: &Path) -> String {
        match self {
            VerificationMode::Entry => python_command(entry),
            VerificationMode::Pytest { .. } => "pytest".to_string(),
        }
    }

    pub fn setup_commands(&self) -> Vec<String> {
        match self {
            VerificationMode::Entry => Vec::new(),
            VerificationMode::Pytest { .. } => vec!["pip install pytest --quiet".to_string()],
        }
    }

    /// Installing the runner needs the package index.
    pub fn needs_network(&self) -> bool {
        matches!(self, VerificationMode::Pytest { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            VerificationMode::Entry => "entry",
            VerificationMode::Pytest { .. } => "pytest",
        }
    }

    /// Text to classify and hand to the fix prompt. pytest reports on
    /// stdout while the installer warns on stderr, so a failed suite run
    /// keeps both, stdout last so its summary survives tail truncation.
    pub fn failure_output(&self, verdict: &ExecutionVerdict) -> String {
        match self {
            VerificationMode::Pytest { .. } if !verdict.passed() => {
                [verdict.stderr.trim_end(), verdict.stdout.trim_end()]
                    .into_iter()
                    .filter(|stream| !stream.trim().is_empty())
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            _ => verdict.diagnostics().to_string(),
        }
    }
}

/// `python <path>` with the path quoted for `sh -c`.
pub fn python_command(script: &Path) -> String {
    let path = script
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    format!("python {}", shell_quote(&path))
}

pub(crate) fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '/' | '_' | '-'));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Private copy of the snapshot for one call. Removed when dropped.
pub(crate) fn stage_snapshot(snapshot: &Path) -> Result<TempDir, SandboxError> {
    if !snapshot.is_dir() {
        return Err(SandboxError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("snapshot not found: {}", snapshot.display()),
        )));
    }
    let staging = tempfile::Builder::new().prefix(STAGING_PREFIX).tempdir()?;
    crate::workspace::copy_tree(snapshot, staging.path())
        .map_err(|e| SandboxError::Io(std::io::Error::other(e.to_string())))?;
    Ok(staging)
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

async fn pump<R: AsyncRead + Unpin>(mut reader: R, sink: SharedBuffer) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = sink.lock() {
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.len() > MAX_CAPTURE_BYTES {
                        let excess = buf.len() - MAX_CAPTURE_BYTES;
                        buf.drain(..excess);
                    }
                }
            }
        }
    }
}

fn drain_buffer(buffer: &SharedBuffer) -> String {
    buffer
        .lock()
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

/// SIGKILL every process in the group led by `pid`. The spawned shell leads
/// its own group, so this also reaches commands it did not `exec`.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: the group already exited.
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::debug!(pid, error = %err, "Failed to kill process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Spawn `command`, capture both streams separately and enforce `timeout`.
///
/// On timeout the child's whole process group is killed and whatever was
/// captured so far is returned with `timed_out = true`. Spawn failures are
/// returned as-is so each backend can decide what they mean.
pub(crate) async fn run_captured(
    command: &mut tokio::process::Command,
    timeout: Duration,
) -> std::io::Result<ExecutionVerdict> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    let mut child = command.spawn()?;
    let pid = child.id();

    let stdout_buf: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump(out, stdout_buf.clone())));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump(err, stderr_buf.clone())));

    let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (Some(status?), false),
        Err(_) => {
            kill_process_group(pid);
            let _ = child.kill().await;
            (None, true)
        }
    };
    // Background jobs the command left behind go with it.
    if !timed_out {
        kill_process_group(pid);
    }

    // Grandchildren can hold the pipes open after the direct child exits.
    for mut task in [stdout_task, stderr_task].into_iter().flatten() {
        if tokio::time::timeout(READER_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }

    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        status.and_then(|s| s.code()).unwrap_or(-1)
    };

    Ok(ExecutionVerdict {
        exit_code,
        stdout: drain_buffer(&stdout_buf),
        stderr: drain_buffer(&stderr_buf),
        timed_out,
    })
}
