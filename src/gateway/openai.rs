//! OpenAI-compatible chat completions provider.

use super::TextProvider;
use crate::config::ProviderConfig;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retries per provider for rate limits, server errors and timeouts.
pub(crate) const MAX_RETRIES: u32 = 2;
pub(crate) const INITIAL_BACKOFF_MS: u64 = 2000;
pub(crate) const BACKOFF_MULTIPLIER: u64 = 2;
const TOP_P: f32 = 0.9;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> anyhow::Result<Self> {
        let client = create_http_client(config.timeout_secs)?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    async fn send_with_retry(&self, api_key: &str, request: &ChatRequest<'_>) -> anyhow::Result<String> {
        let url = self.endpoint();
        let mut retry_count = 0;

        loop {
            let response = match self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", api_key))
                .json(request)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        self.wait_before_retry(retry_count, &err.to_string()).await;
                        continue;
                    }
                    return Err(map_transport_error(err, &self.config.name));
                }
            };

            let status = response.status();
            let text = match response.text().await {
                Ok(text) => text,
                Err(err) => {
                    if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        self.wait_before_retry(retry_count, &err.to_string()).await;
                        continue;
                    }
                    return Err(map_transport_error(err, &self.config.name));
                }
            };

            if status.is_success() {
                return Ok(text);
            }

            let retryable = status.as_u16() == 429 || status.is_server_error();
            if retryable && retry_count < MAX_RETRIES {
                retry_count += 1;
                self.wait_before_retry(retry_count, status.as_str()).await;
                continue;
            }

            let error_msg = match status.as_u16() {
                401 | 403 => format!(
                    "{} rejected the API key from {}",
                    self.config.name, self.config.api_key_env
                ),
                429 => format!(
                    "Rate limited by {} after {} retries",
                    self.config.name, retry_count
                ),
                500..=599 => format!(
                    "{} server error ({}). The service may be temporarily unavailable.",
                    self.config.name, status
                ),
                _ => format!(
                    "API error {}: {}",
                    status,
                    crate::util::truncate(text.trim(), 200)
                ),
            };
            return Err(anyhow::anyhow!("{}", error_msg));
        }
    }

    async fn wait_before_retry(&self, retry_count: u32, cause: &str) {
        let secs = backoff_secs(retry_count);
        tracing::warn!(
            provider = %self.config.name,
            attempt = retry_count,
            max = MAX_RETRIES,
            cause = %crate::util::truncate(cause, 120),
            "Provider request failed, retrying in {}s",
            secs
        );
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

impl TextProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn complete<'a>(&'a self, system: &'a str, user: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let api_key = self
                .config
                .api_key()
                .ok_or_else(|| anyhow::anyhow!("{} is not set", self.config.api_key_env))?;

            let request = ChatRequest {
                model: &self.config.model,
                messages: vec![
                    Message {
                        role: "system",
                        content: system,
                    },
                    Message {
                        role: "user",
                        content: user,
                    },
                ],
                temperature: self.config.temperature,
                top_p: TOP_P,
                max_tokens: self.config.max_tokens,
                stream: false,
            };

            let text = self.send_with_retry(&api_key, &request).await?;
            extract_content(&text)
        })
    }
}

fn extract_content(body: &str) -> anyhow::Result<String> {
    let parsed: ChatResponse = serde_json::from_str(body).map_err(|e| {
        anyhow::anyhow!(
            "Failed to parse completion response: {} ({})",
            e,
            crate::util::truncate(body, 200)
        )
    })?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("Provider returned no content"))
}

pub(crate) fn backoff_secs(retry_count: u32) -> u64 {
    let factor = BACKOFF_MULTIPLIER.pow(retry_count.saturating_sub(1));
    let ms = INITIAL_BACKOFF_MS.saturating_mul(factor);
    let secs = ms / 1000;
    if secs == 0 {
        1
    } else {
        secs
    }
}

pub(crate) fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn map_transport_error(err: reqwest::Error, provider: &str) -> anyhow::Error {
    if err.is_timeout() {
        anyhow::anyhow!("{} request timed out", provider)
    } else {
        anyhow::anyhow!("{} request failed: {}", provider, err)
    }
}

pub(crate) fn create_http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))
}
