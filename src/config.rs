//! Configuration for opsguard
//!
//! Read from TOML, first match wins:
//! 1. `--config <file>` (must exist and parse)
//! 2. `./opsguard.toml`
//! 3. `<config_dir>/opsguard/config.toml`
//!
//! A discovered file that fails to parse is reported and defaults are used.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const LOCAL_CONFIG_FILE: &str = "opsguard.toml";
const CONFIG_DIR_NAME: &str = "opsguard";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    #[default]
    Docker,
    Process,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    /// Pinned base image. Not selectable per run.
    pub image: String,
    pub timeout_secs: u64,
    pub disable_network: bool,
    /// Passed to `docker run --memory`, e.g. "512m".
    pub memory_limit: Option<String>,
    pub cpus: Option<f64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Docker,
            image: "python:3.11-slim".to_string(),
            timeout_secs: 120,
            disable_network: true,
            memory_limit: None,
            cpus: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReproductionStrategy {
    /// Run the verification command itself.
    #[default]
    Entry,
    /// Ask the gateway for a dedicated reproduction script.
    Generated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReproductionConfig {
    pub strategy: ReproductionStrategy,
    /// End the run as not reproducible on the first clean run instead of
    /// retrying.
    pub stop_on_clean_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub dir: PathBuf,
    /// Ask the gateway for a PR description after a successful run.
    pub pr_description: bool,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("artifacts"),
            pr_description: false,
        }
    }
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_provider_timeout() -> u64 {
    60
}

/// One OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl ProviderConfig {
    fn new(name: &str, base_url: &str, model: &str, api_key_env: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.to_string(),
            model: model.to_string(),
            api_key_env: api_key_env.to_string(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_provider_timeout(),
        }
    }

    /// API key from the environment. Empty values count as missing.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig::new(
            "nvidia",
            "https://integrate.api.nvidia.com/v1",
            "meta/llama-3.1-70b-instruct",
            "NVIDIA_API_KEY",
        ),
        ProviderConfig::new(
            "groq",
            "https://api.groq.com/openai/v1",
            "llama-3.3-70b-versatile",
            "GROQ_API_KEY",
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub reproduction: ReproductionConfig,
    pub artifacts: ArtifactsConfig,
    /// Ordered: the first entry is the primary, the second the fallback.
    pub providers: Vec<ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            reproduction: ReproductionConfig::default(),
            artifacts: ArtifactsConfig::default(),
            providers: default_providers(),
        }
    }
}

/// Where the loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Defaults => write!(f, "built-in defaults"),
        }
    }
}

impl Config {
    /// Per-user config file path.
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    fn discovery_candidates() -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
        if let Some(path) = Self::user_config_path() {
            candidates.push(path);
        }
        candidates
    }

    /// Load from an explicit path, or discover one, or fall back to defaults.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, ConfigSource), ConfigError> {
        Self::load_from(explicit, &Self::discovery_candidates())
    }

    fn load_from(
        explicit: Option<&Path>,
        candidates: &[PathBuf],
    ) -> Result<(Self, ConfigSource), ConfigError> {
        if let Some(path) = explicit {
            let config = Self::read_file(path)?;
            return Ok((config, ConfigSource::File(path.to_path_buf())));
        }

        for path in candidates.iter().filter(|p| p.is_file()) {
            match Self::read_file(path) {
                Ok(config) => return Ok((config, ConfigSource::File(path.clone()))),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "Config file is unusable; defaults were loaded"
                    );
                    return Ok((Self::default(), ConfigSource::Defaults));
                }
            }
        }

        Ok((Self::default(), ConfigSource::Defaults))
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sandbox.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.sandbox.image.trim().is_empty() {
            return Err(ConfigError::Invalid("sandbox.image must not be empty".to_string()));
        }
        if self.providers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[providers]] entry is required".to_string(),
            ));
        }
        for provider in &self.providers {
            if provider.name.trim().is_empty() || provider.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "every provider needs a name and a base_url".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.sandbox.image, "python:3.11-slim");
        assert_eq!(config.sandbox.timeout_secs, 120);
        assert!(config.sandbox.disable_network);
        assert_eq!(config.reproduction.strategy, ReproductionStrategy::Entry);
        assert!(!config.reproduction.stop_on_clean_run);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].name, "nvidia");
        assert_eq!(config.providers[1].api_key_env, "GROQ_API_KEY");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sandbox]
            backend = "process"
            timeout_secs = 30

            [reproduction]
            stop_on_clean_run = true
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.backend, SandboxBackend::Process);
        assert_eq!(config.sandbox.timeout_secs, 30);
        assert_eq!(config.sandbox.image, "python:3.11-slim");
        assert!(config.reproduction.stop_on_clean_run);
        assert_eq!(config.providers.len(), 2);
    }

    #[test]
    fn test_provider_list_replaces_defaults() {
        let config: Config = toml::from_str(
            r#"
            [[providers]]
            name = "local"
            base_url = "http://localhost:8000/v1"
            model = "qwen"
            api_key_env = "LOCAL_KEY"
            "#,
        )
        .unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].max_tokens, 4096);
        assert!((config.providers[0].temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_explicit_file_must_parse() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[sandbox\n").unwrap();
        assert!(matches!(
            Config::load_from(Some(&path), &[]),
            Err(ConfigError::Parse { .. })
        ));

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Config::load_from(Some(&missing), &[]),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_discovered_corrupt_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("opsguard.toml");
        std::fs::write(&path, "sandbox = 12").unwrap();
        let (config, source) = Config::load_from(None, &[path]).unwrap();
        assert_eq!(source, ConfigSource::Defaults);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_discovery_order() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first.toml");
        let second = dir.path().join("second.toml");
        std::fs::write(&second, "[sandbox]\ntimeout_secs = 5\n").unwrap();
        let (config, source) =
            Config::load_from(None, &[first.clone(), second.clone()]).unwrap();
        assert_eq!(source, ConfigSource::File(second));
        assert_eq!(config.sandbox.timeout_secs, 5);

        let (_, source) = Config::load_from(None, &[first]).unwrap();
        assert_eq!(source, ConfigSource::Defaults);
    }

    #[test]
    fn test_validation_rejects_zero_timeout_and_empty_providers() {
        let mut config = Config::default();
        config.sandbox.timeout_secs = 0;
        assert!(config.validate().is_err());

        let config = Config {
            providers: Vec::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_api_key_env_is_none() {
        let provider = ProviderConfig::new(
            "test",
            "http://localhost",
            "m",
            "OPSGUARD_TEST_KEY_THAT_IS_NEVER_SET",
        );
        assert!(provider.api_key().is_none());
    }
}
