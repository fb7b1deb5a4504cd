//! LLM provider abstraction.
//!
//! Every provider is reduced to one capability: generate text for a
//! prompt. The concrete implementation speaks the OpenAI-compatible
//! chat-completions shape, which all three configured providers accept.
//! The fan-out order and retry policy live in the planner, not here.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::ProviderConfig;
use crate::retry::{classify_http, ErrorClass};

/// Error from a single generation attempt.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error talking to {provider}: {source}")]
    Transport {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} returned HTTP {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} returned a response with no content")]
    EmptyResponse { provider: String },
}

impl ProviderError {
    /// Classification for the fan-out loop.
    pub fn class(&self) -> ErrorClass {
        match self {
            // Connection-level failures are worth one more try.
            Self::Transport { .. } => ErrorClass::Retryable,
            Self::Http { status, body, .. } => classify_http(*status, body),
            Self::EmptyResponse { .. } => ErrorClass::Fatal,
        }
    }
}

/// The one capability the planner needs from a provider.
#[async_trait]
pub trait GenerateText: Send + Sync {
    /// Human-readable provider name for logs.
    fn name(&self) -> &str;

    /// Whether this provider is configured with credentials.
    fn available(&self) -> bool;

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// OpenAI-compatible chat-completions client.
pub struct ChatProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl ChatProvider {
    pub fn new(config: ProviderConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl GenerateText for ChatProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn available(&self) -> bool {
        self.config.has_credentials()
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.config.model,
            "temperature": 0,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.as_deref().unwrap_or_default())
            .json(&body)
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: self.config.name.clone(),
                source,
            })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: self.config.name.clone(),
                source,
            })?;

        if !(200..300).contains(&status) {
            return Err(ProviderError::Http {
                provider: self.config.name.clone(),
                status,
                body: text,
            });
        }

        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|_| ProviderError::EmptyResponse {
                provider: self.config.name.clone(),
            })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ProviderError::EmptyResponse {
                provider: self.config.name.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_classes() {
        let overloaded = ProviderError::Http {
            provider: "primary".to_owned(),
            status: 503,
            body: String::new(),
        };
        assert_eq!(overloaded.class(), ErrorClass::Retryable);

        let quota = ProviderError::Http {
            provider: "primary".to_owned(),
            status: 429,
            body: "quota exceeded".to_owned(),
        };
        assert_eq!(quota.class(), ErrorClass::Quota);

        let empty = ProviderError::EmptyResponse {
            provider: "primary".to_owned(),
        };
        assert_eq!(empty.class(), ErrorClass::Fatal);
    }
}
