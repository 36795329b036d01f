//! # Conductor Models
//!
//! Centralized identity and LLM configuration types shared by the
//! orchestrator, the agents and the server surface.

use serde::{Deserialize, Serialize};

/// Supported LLM providers.
///
/// API keys are loaded from the environment per provider:
/// - Anthropic - `ANTHROPIC_API_KEY`
/// - OpenAI - `OPENAI_API_KEY`
/// - OpenRouter - `OPENROUTER_API_KEY`
/// - DeepSeek - `DEEPSEEK_API_KEY`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    OpenRouter,
    DeepSeek,
}

impl LlmProvider {
    pub fn all() -> Vec<LlmProvider> {
        vec![
            LlmProvider::Anthropic,
            LlmProvider::OpenAI,
            LlmProvider::OpenRouter,
            LlmProvider::DeepSeek,
        ]
    }

    /// Display name for UI
    pub fn display_name(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "Anthropic",
            LlmProvider::OpenAI => "OpenAI",
            LlmProvider::OpenRouter => "OpenRouter",
            LlmProvider::DeepSeek => "DeepSeek",
        }
    }

    /// Environment variable holding the API key
    pub fn api_key_env(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
            LlmProvider::OpenAI => "OPENAI_API_KEY",
            LlmProvider::OpenRouter => "OPENROUTER_API_KEY",
            LlmProvider::DeepSeek => "DEEPSEEK_API_KEY",
        }
    }

    /// Default API base URL for OpenAI-compatible providers
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            LlmProvider::Anthropic => None,
            LlmProvider::OpenAI => Some("https://api.openai.com/v1"),
            LlmProvider::OpenRouter => Some("https://openrouter.ai/api/v1"),
            LlmProvider::DeepSeek => Some("https://api.deepseek.com/v1"),
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "claude-sonnet-4-20250514",
            LlmProvider::OpenAI => "gpt-4o",
            LlmProvider::OpenRouter => "anthropic/claude-3.5-sonnet",
            LlmProvider::DeepSeek => "deepseek-chat",
        }
    }
}

/// Per-agent LLM selection: provider, model and sampling limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// LLM provider to use
    #[serde(default)]
    pub provider: LlmProvider,
    /// Model name (e.g. "claude-sonnet-4-20250514", "gpt-4o")
    pub model: String,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Token cap for one completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-request deadline in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Optional base URL override for OpenAI-compatible endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            model: LlmProvider::Anthropic.default_model().to_string(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            base_url: None,
        }
    }
}

impl ModelConfig {
    pub fn with_provider(provider: LlmProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            ..Self::default()
        }
    }
}

/// Worker roles. Each role has its own queue and its own worker process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Executor,
    Tester,
    Documenter,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Executor, Role::Tester, Role::Documenter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Executor => "executor",
            Role::Tester => "tester",
            Role::Documenter => "documenter",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "executor" => Some(Role::Executor),
            "tester" => Some(Role::Tester),
            "documenter" => Some(Role::Documenter),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every long-lived agent the supervisor manages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentId {
    Coordinator,
    Executor,
    Tester,
    Documenter,
    Structurer,
}

impl AgentId {
    pub const ALL: [AgentId; 5] = [
        AgentId::Coordinator,
        AgentId::Executor,
        AgentId::Tester,
        AgentId::Documenter,
        AgentId::Structurer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentId::Coordinator => "coordinator",
            AgentId::Executor => "executor",
            AgentId::Tester => "tester",
            AgentId::Documenter => "documenter",
            AgentId::Structurer => "structurer",
        }
    }

    pub fn parse(s: &str) -> Option<AgentId> {
        match s {
            "coordinator" => Some(AgentId::Coordinator),
            "executor" => Some(AgentId::Executor),
            "tester" => Some(AgentId::Tester),
            "documenter" => Some(AgentId::Documenter),
            "structurer" => Some(AgentId::Structurer),
            _ => None,
        }
    }

    /// The worker role this agent serves, if it is a role worker.
    pub fn role(&self) -> Option<Role> {
        match self {
            AgentId::Executor => Some(Role::Executor),
            AgentId::Tester => Some(Role::Tester),
            AgentId::Documenter => Some(Role::Documenter),
            _ => None,
        }
    }
}

impl From<Role> for AgentId {
    fn from(role: Role) -> Self {
        match role {
            Role::Executor => AgentId::Executor,
            Role::Tester => AgentId::Tester,
            Role::Documenter => AgentId::Documenter,
        }
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ModelConfig::default();
        assert_eq!(config.provider, LlmProvider::Anthropic);
        assert!(config.model.contains("claude"));
    }

    #[test]
    fn test_provider_serialization() {
        let config = ModelConfig::with_provider(LlmProvider::OpenAI, "gpt-4o");
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("openai"));
        assert!(json.contains("gpt-4o"));
    }

    #[test]
    fn test_role_round_trip() {
        for role in Role::ALL {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("critic"), None);
    }

    #[test]
    fn test_agent_role_mapping() {
        assert_eq!(AgentId::Executor.role(), Some(Role::Executor));
        assert_eq!(AgentId::Coordinator.role(), None);
        assert_eq!(AgentId::from(Role::Tester), AgentId::Tester);
    }
}
