//! Generation gateway
//!
//! One capability, "generate text for a prompt kind", backed by an ordered
//! list of interchangeable providers. The gateway proposes text only: it
//! never executes anything, touches the filesystem or sees run state.

pub mod openai;
pub mod prompts;
pub mod validate;

pub use openai::OpenAiProvider;
pub use validate::Rejection;

use crate::config::ProviderConfig;
use crate::error::{GatewayError, ProviderFailure};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Primary plus one fallback.
pub const MAX_PROVIDER_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromptKind {
    ReproductionScript,
    FixContent,
    PrDescription,
}

impl PromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::ReproductionScript => "REPRODUCTION_SCRIPT",
            PromptKind::FixContent => "FIX_CONTENT",
            PromptKind::PrDescription => "PR_DESCRIPTION",
        }
    }
}

/// Run context rendered into prompts. Text only; nothing here is trusted.
#[derive(Debug, Clone, Default)]
pub struct GenerationContext {
    pub error_description: String,
    pub target_file: String,
    /// Baseline content of the target file.
    pub original_content: String,
    pub failure_output: Option<String>,
    /// 1-based fix attempt number.
    pub attempt: u32,
    pub diff: Option<String>,
}

/// A text-in/text-out completion backend.
pub trait TextProvider: Send + Sync {
    fn name(&self) -> &str;

    fn complete<'a>(&'a self, system: &'a str, user: &'a str) -> BoxFuture<'a, anyhow::Result<String>>;
}

pub struct Gateway {
    providers: Vec<Arc<dyn TextProvider>>,
}

impl Gateway {
    pub fn new(providers: Vec<Arc<dyn TextProvider>>) -> Self {
        Self { providers }
    }

    pub fn from_config(configs: &[ProviderConfig]) -> anyhow::Result<Self> {
        if configs.len() > MAX_PROVIDER_ATTEMPTS {
            tracing::warn!(
                configured = configs.len(),
                used = MAX_PROVIDER_ATTEMPTS,
                "Only the first two providers are used"
            );
        }
        let providers = configs
            .iter()
            .take(MAX_PROVIDER_ATTEMPTS)
            .map(|cfg| OpenAiProvider::new(cfg.clone()).map(|p| Arc::new(p) as Arc<dyn TextProvider>))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::new(providers))
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Generate and validate text for `kind`.
    ///
    /// The same prompt goes to the primary and, on any failure, once to the
    /// fallback. There is no reprompting beyond that.
    pub async fn generate(
        &self,
        kind: PromptKind,
        ctx: &GenerationContext,
    ) -> Result<String, GatewayError> {
        if self.providers.is_empty() {
            return Err(GatewayError::NoProviders);
        }

        let system = prompts::system_prompt(kind);
        let user = prompts::user_prompt(kind, ctx);
        let mut failures = Vec::new();

        for provider in self.providers.iter().take(MAX_PROVIDER_ATTEMPTS) {
            let reason = match provider.complete(system, &user).await {
                Ok(text) => match validate::validate(kind, &text, ctx) {
                    Ok(accepted) => {
                        tracing::info!(
                            provider = provider.name(),
                            kind = kind.as_str(),
                            fallback = !failures.is_empty(),
                            "Generation accepted"
                        );
                        return Ok(accepted);
                    }
                    Err(rejection) => format!("rejected: {}", rejection),
                },
                Err(err) => err.to_string(),
            };

            tracing::warn!(
                provider = provider.name(),
                kind = kind.as_str(),
                reason = %reason,
                "Provider attempt failed"
            );
            failures.push(ProviderFailure {
                provider: provider.name().to_string(),
                reason,
            });
        }

        Err(GatewayError::AllProvidersFailed(failures))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProvider;
    use super::*;

    const ORIGINAL: &str = "def divide(a, b):\n    return a / b\n";
    const FIXED: &str = "def divide(a, b):\n    if b == 0:\n        return None\n    return a / b\n";

    fn ctx() -> GenerationContext {
        GenerationContext {
            error_description: "ZeroDivisionError".to_string(),
            target_file: "app.py".to_string(),
            original_content: ORIGINAL.to_string(),
            failure_output: Some("ZeroDivisionError: division by zero".to_string()),
            attempt: 1,
            diff: None,
        }
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let primary = Arc::new(ScriptedProvider::ok("primary", &[FIXED]));
        let fallback = Arc::new(ScriptedProvider::ok("fallback", &[FIXED]));
        let gateway = Gateway::new(vec![primary.clone(), fallback.clone()]);

        let text = gateway.generate(PromptKind::FixContent, &ctx()).await.unwrap();
        assert_eq!(text, FIXED);
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_transport_error_falls_back_with_same_prompt() {
        let primary = Arc::new(ScriptedProvider::new(
            "primary",
            vec![Err(anyhow::anyhow!("connection reset"))],
        ));
        let fallback = Arc::new(ScriptedProvider::ok("fallback", &[FIXED]));
        let gateway = Gateway::new(vec![primary.clone(), fallback.clone()]);

        let text = gateway.generate(PromptKind::FixContent, &ctx()).await.unwrap();
        assert_eq!(text, FIXED);
        assert_eq!(primary.prompts(), fallback.prompts());
    }

    #[tokio::test]
    async fn test_validation_failure_falls_back() {
        let fenced = format!("```python\n{}```", FIXED);
        let primary = Arc::new(ScriptedProvider::ok("primary", &[&fenced]));
        let fallback = Arc::new(ScriptedProvider::ok("fallback", &[FIXED]));
        let gateway = Gateway::new(vec![primary, fallback.clone()]);

        assert!(gateway.generate(PromptKind::FixContent, &ctx()).await.is_ok());
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_second_failure_surfaces_both_reasons() {
        let primary = Arc::new(ScriptedProvider::ok("primary", &["Here is the fix: divide safely"]));
        let fallback = Arc::new(ScriptedProvider::ok("fallback", &["def broken(:\n"]));
        let gateway = Gateway::new(vec![primary.clone(), fallback.clone()]);

        let err = gateway.generate(PromptKind::FixContent, &ctx()).await.unwrap_err();
        match err {
            GatewayError::AllProvidersFailed(failures) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].provider, "primary");
                assert!(failures[0].reason.contains("prose"));
                assert!(failures[1].reason.contains("syntax"));
            }
            other => panic!("unexpected error: {}", other),
        }
        // No reprompting beyond the fallback.
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_extra_providers_are_not_tried() {
        let a = Arc::new(ScriptedProvider::new("a", vec![Err(anyhow::anyhow!("down"))]));
        let b = Arc::new(ScriptedProvider::new("b", vec![Err(anyhow::anyhow!("down"))]));
        let c = Arc::new(ScriptedProvider::ok("c", &[FIXED]));
        let gateway = Gateway::new(vec![a, b, c.clone()]);

        assert!(gateway.generate(PromptKind::FixContent, &ctx()).await.is_err());
        assert_eq!(c.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_providers() {
        let gateway = Gateway::new(Vec::new());
        assert!(matches!(
            gateway.generate(PromptKind::FixContent, &ctx()).await,
            Err(GatewayError::NoProviders)
        ));
    }

    #[test]
    fn test_from_config_keeps_two() {
        let gateway = Gateway::from_config(&crate::config::Config::default().providers).unwrap();
        assert_eq!(gateway.provider_names(), vec!["nvidia", "groq"]);
    }
}
