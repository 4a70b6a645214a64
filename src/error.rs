//! Error types for the component boundaries.
//!
//! Only the sandbox distinguishes infrastructure failure from everything
//! else; the orchestrator routes on [`SandboxError::is_infrastructure`].

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The execution backend could not be reached or could not create the
    /// environment (daemon down, image pull failure, CLI missing).
    #[error("sandbox backend unavailable: {0}")]
    Unavailable(String),

    /// Local staging of the snapshot copy failed.
    #[error("failed to stage workspace copy: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, SandboxError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("repository not found: {}", .0.display())]
    RepoMissing(PathBuf),

    #[error("failed to copy repository into workspace: {0}")]
    Copy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("target file not found in workspace: {}", .0.display())]
    TargetMissing(PathBuf),

    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One provider's failure inside a gateway call.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no text providers configured")]
    NoProviders,

    #[error("all providers failed: {}", summarize(.0))]
    AllProvidersFailed(Vec<ProviderFailure>),
}

fn summarize(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.provider, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
