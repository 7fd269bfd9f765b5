//! OpenRouter chat-completions client.

use super::{GenerationOracle, GenerationRequest, OracleError, OracleReply, Usage};
use crate::config::ForgeConfig;
use crate::util::truncate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// OpenRouter direct API URL (BYOK mode)
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    stream: bool,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
    model: Option<String>,
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

/// Extract a retry-after hint like "retry after 12 seconds" from an error body.
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    text_lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_numeric())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}

fn backoff_secs(retry_count: u32) -> u64 {
    (INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count.saturating_sub(1))) / 1000
}

pub struct OpenRouterOracle {
    client: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
}

impl OpenRouterOracle {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            url: OPENROUTER_URL.to_string(),
        }
    }

    pub fn from_config(config: &ForgeConfig) -> anyhow::Result<Self> {
        let key = config.api_key().ok_or_else(|| {
            anyhow::anyhow!("No API key configured. Set OPENROUTER_API_KEY or store one in the system keychain.")
        })?;
        Ok(Self::new(key, config.model.clone()))
    }

    /// Point at a different OpenAI-compatible endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl GenerationOracle for OpenRouterOracle {
    async fn generate(&self, request: &GenerationRequest) -> Result<OracleReply, OracleError> {
        if self.api_key.trim().is_empty() {
            return Err(OracleError::MissingApiKey);
        }
        let user = request.user_prompt();
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: request.system_prompt(),
                },
                Message {
                    role: "user",
                    content: &user,
                },
            ],
            max_tokens: request.max_output_tokens,
            stream: false,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let mut retry_count = 0;
        loop {
            let response = self
                .client
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("HTTP-Referer", "https://cosmos.dev")
                .header("X-Title", "Cosmos Forge")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await
                .map_err(|e| OracleError::Transport(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| OracleError::Transport(e.to_string()))?;

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
                    OracleError::Payload(format!("{}: {}", e, truncate(&text, 200)))
                })?;
                let content = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default();
                tracing::debug!(
                    task_id = %request.task_id,
                    chars = content.len(),
                    follow_up = request.is_follow_up(),
                    "oracle replied"
                );
                return Ok(OracleReply {
                    content,
                    usage: parsed.usage,
                    model: parsed.model.unwrap_or_else(|| self.model.clone()),
                });
            }

            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let wait = parse_retry_after(&text).unwrap_or_else(|| backoff_secs(retry_count));
                tracing::warn!(
                    wait_secs = wait,
                    attempt = retry_count,
                    max = MAX_RETRIES,
                    "OpenRouter rate limited; retrying"
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }

            let message = match status.as_u16() {
                401 => "Invalid API key".to_string(),
                429 => format!("Rate limited by OpenRouter after {} retries", retry_count),
                500..=599 => "OpenRouter server error; the service may be temporarily unavailable"
                    .to_string(),
                _ => truncate(&text, 200),
            };
            return Err(OracleError::Provider {
                status: status.as_u16(),
                message,
            });
        }
    }

    fn name(&self) -> &str {
        "openrouter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_hint_is_parsed() {
        assert_eq!(parse_retry_after("Please retry after 12 seconds"), Some(12));
        assert_eq!(parse_retry_after("rate limited"), None);
        assert_eq!(parse_retry_after("retry in 999 seconds"), None);
    }

    #[test]
    fn backoff_grows_exponentially() {
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(2), 4);
        assert_eq!(backoff_secs(3), 8);
    }

    #[tokio::test]
    async fn empty_key_fails_before_any_request() {
        let oracle = OpenRouterOracle::new("", "some/model");
        let request = GenerationRequest {
            task_id: "t".into(),
            instruction: "x".into(),
            constraints: None,
            files: vec![],
            follow_up: None,
            max_output_tokens: 10,
        };
        assert!(matches!(
            oracle.generate(&request).await,
            Err(OracleError::MissingApiKey)
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let oracle = OpenRouterOracle::new("key", "some/model")
            .with_url("http://127.0.0.1:9/v1/chat/completions");
        assert_eq!(oracle.model(), "some/model");
        let request = GenerationRequest {
            task_id: "t".into(),
            instruction: "x".into(),
            constraints: None,
            files: vec![],
            follow_up: None,
            max_output_tokens: 10,
        };
        assert!(matches!(
            oracle.generate(&request).await,
            Err(OracleError::Transport(_))
        ));
    }
}
