//! OpenAI-compatible chat completion client with bounded retry.

pub mod intent;

use crate::config::AiConfig;
use crate::error::CompletionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const TEMPERATURE: f64 = 0.7;
pub const MAX_TOKENS: u32 = 2000;
/// First backoff; doubled on every further attempt.
pub const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Anything that can turn a prompt into completion text.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, CompletionError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// How a single attempt ended when it did not produce text.
enum AttemptFailure {
    Timeout,
    Transport(String),
    Format(String),
}

pub fn next_backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1_u32 << attempt.min(6))
}

#[derive(Debug, Clone)]
pub struct CompletionClient {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
}

impl CompletionClient {
    pub fn new(config: &AiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.trim().to_string(),
            endpoint: format!(
                "{}/chat/completions",
                config.api_base.trim().trim_end_matches('/')
            ),
            model: config.model_name.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            max_retries: config.max_retries.max(1),
            backoff_base: BASE_BACKOFF,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn attempt(&self, body: &ChatRequest<'_>) -> Result<String, AttemptFailure> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    AttemptFailure::Timeout
                } else {
                    AttemptFailure::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AttemptFailure::Transport(format!(
                "HTTP {}: {}",
                status.as_u16(),
                crate::util::truncate_with_ellipsis(&text, 200)
            )));
        }

        let text = response.text().await.map_err(|err| {
            if err.is_timeout() {
                AttemptFailure::Timeout
            } else {
                AttemptFailure::Transport(err.to_string())
            }
        })?;
        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| AttemptFailure::Format(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AttemptFailure::Format("missing choices[0].message.content".into()))
    }
}

#[async_trait]
impl Completer for CompletionClient {
    async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, CompletionError> {
        if self.api_key.is_empty() {
            return Err(CompletionError::Config);
        }

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match self.attempt(&body).await {
                Ok(content) => {
                    tracing::info!(attempt, len = content.chars().count(), "AI completion succeeded");
                    return Ok(content);
                }
                Err(AttemptFailure::Format(detail)) => {
                    tracing::error!("AI completion response malformed: {detail}");
                    return Err(CompletionError::UpstreamFormat(detail));
                }
                Err(failure) => failure,
            };

            match &failure {
                AttemptFailure::Timeout => {
                    tracing::warn!(attempt, max = self.max_retries, "AI completion timed out");
                }
                AttemptFailure::Transport(detail) => {
                    tracing::warn!(attempt, max = self.max_retries, "AI completion failed: {detail}");
                }
                AttemptFailure::Format(_) => {}
            }

            if attempt >= self.max_retries {
                return Err(match failure {
                    AttemptFailure::Timeout => CompletionError::UpstreamTimeout { attempts: attempt },
                    AttemptFailure::Transport(detail) | AttemptFailure::Format(detail) => {
                        CompletionError::UpstreamError {
                            attempts: attempt,
                            detail,
                        }
                    }
                });
            }

            tokio::time::sleep(next_backoff(self.backoff_base, attempt - 1)).await;
        }
    }
}
