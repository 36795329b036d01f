//! # Provider Adapter
//!
//! The boundary to LLM vendors. Agents only see [`ProviderClient`]; the
//! orchestrator never calls a provider. Each call carries its own deadline
//! and the error taxonomy the retry policy keys on.

use async_trait::async_trait;

use crate::models::{LlmProvider, ModelConfig};

pub mod anthropic;
pub mod openai;

/// One chat-completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
}

/// Failure modes the retry policy distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,
    #[error("provider rate limited the request")]
    RateLimited,
    #[error("provider returned upstream error {0}")]
    Upstream(u16),
    #[error("invalid provider response: {0}")]
    Invalid(String),
    #[error("missing API key: {0}")]
    MissingKey(String),
}

impl ProviderError {
    /// Transient errors are retried with backoff; the rest surface at once.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout | ProviderError::RateLimited | ProviderError::Upstream(_)
        )
    }

    /// Map a transport error onto the taxonomy.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = e.status() {
            if status.as_u16() == 429 {
                ProviderError::RateLimited
            } else if status.is_server_error() {
                ProviderError::Upstream(status.as_u16())
            } else {
                ProviderError::Invalid(e.to_string())
            }
        } else {
            ProviderError::Invalid(e.to_string())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        if status.as_u16() == 429 {
            ProviderError::RateLimited
        } else if status.is_server_error() {
            ProviderError::Upstream(status.as_u16())
        } else {
            ProviderError::Invalid(format!("status {status}: {body}"))
        }
    }
}

/// A stateless chat-completion client.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError>;
}

/// Build the client for a model configuration. API keys come from the
/// provider's environment variable.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn ProviderClient>, ProviderError> {
    let key = std::env::var(config.provider.api_key_env())
        .map_err(|_| ProviderError::MissingKey(config.provider.api_key_env().to_string()))?;
    match config.provider {
        LlmProvider::Anthropic => Ok(Box::new(anthropic::AnthropicClient::new(
            key,
            config.clone(),
        ))),
        LlmProvider::OpenAI | LlmProvider::OpenRouter | LlmProvider::DeepSeek => {
            Ok(Box::new(openai::OpenAiCompatClient::new(key, config.clone())))
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted provider for agent tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays a fixed sequence of responses.
    pub struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<String, ProviderError>>>,
    }

    impl ScriptedProvider {
        pub fn new(responses: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, ProviderError> {
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Invalid("script exhausted".to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::RateLimited.is_transient());
        assert!(ProviderError::Upstream(502).is_transient());
        assert!(!ProviderError::Invalid("bad json".to_string()).is_transient());
        assert!(!ProviderError::MissingKey("X".to_string()).is_transient());
    }

    #[test]
    fn test_missing_key_surfaces() {
        std::env::remove_var("OPENROUTER_API_KEY");
        let config = ModelConfig::with_provider(LlmProvider::OpenRouter, "some-model");
        assert!(matches!(
            create_client(&config).err(),
            Some(ProviderError::MissingKey(_))
        ));
    }
}
