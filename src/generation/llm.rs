use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use crate::config::{EnvConfig, GenerationConfig};

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Generator returned empty text")]
    Empty,

    #[error("Generator response could not be parsed: {0}")]
    Malformed(String),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Market {0} has no settled result")]
    Unresolved(String),
}

/// Single prompt-in, text-out completion call.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, GenerationError>;

    fn provider(&self) -> &'static str;
}

pub struct AnthropicClient {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: String, max_tokens: u32, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_key,
            model,
            max_tokens,
        })
    }
}

#[async_trait]
impl TextGenerator for AnthropicClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, GenerationError> {
        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: system_prompt,
            messages: vec![ChatMessage { role: "user", content: user_prompt }],
        };

        let response: AnthropicResponse = self.client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| GenerationError::Provider(e.to_string()))?
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;

        Ok(response
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join(""))
    }

    fn provider(&self) -> &'static str {
        "anthropic"
    }
}

/// OpenAI-style chat completions; also serves Groq's compatible endpoint.
pub struct OpenAiCompatClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    provider: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatClient {
    pub fn new(
        provider: &'static str,
        base_url: &str,
        api_key: String,
        model: String,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            max_tokens,
            provider,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, GenerationError> {
        let request = ChatRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![
                ChatMessage { role: "system", content: system_prompt },
                ChatMessage { role: "user", content: user_prompt },
            ],
            response_format: ResponseFormat { kind: "json_object" },
        };

        let response: ChatResponse = self.client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| GenerationError::Provider(e.to_string()))?
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;

        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    fn provider(&self) -> &'static str {
        self.provider
    }
}

/// Build the generator selected by `LLM_PROVIDER`.
pub fn generator_from_env(env: &EnvConfig, config: &GenerationConfig) -> Result<Arc<dyn TextGenerator>> {
    let timeout = config.request_timeout();
    let model = |default: &str| config.model.clone().unwrap_or_else(|| default.to_string());

    let generator: Arc<dyn TextGenerator> = match env.llm_provider.as_str() {
        "anthropic" => Arc::new(AnthropicClient::new(
            env.anthropic_api_key.clone().context("ANTHROPIC_API_KEY not set")?,
            model("claude-sonnet-4-20250514"),
            config.max_tokens,
            timeout,
        )?),
        "openai" => Arc::new(OpenAiCompatClient::new(
            "openai",
            "https://api.openai.com/v1",
            env.openai_api_key.clone().context("OPENAI_API_KEY not set")?,
            model("gpt-4-turbo-preview"),
            config.max_tokens,
            timeout,
        )?),
        "groq" => Arc::new(OpenAiCompatClient::new(
            "groq",
            "https://api.groq.com/openai/v1",
            env.groq_api_key.clone().context("GROQ_API_KEY not set")?,
            model("llama-3.3-70b-versatile"),
            config.max_tokens,
            timeout,
        )?),
        other => anyhow::bail!("Unsupported LLM provider: {}", other),
    };

    info!("Initialized {} text generator", generator.provider());
    Ok(generator)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(provider: &str) -> EnvConfig {
        EnvConfig {
            llm_provider: provider.to_string(),
            anthropic_api_key: Some("test-key".to_string()),
            openai_api_key: None,
            groq_api_key: Some("gsk-test".to_string()),
            kalshi_api_base: "http://localhost".to_string(),
            redis_url: "redis://localhost".to_string(),
        }
    }

    #[test]
    fn test_provider_selection() {
        let config = GenerationConfig::default();

        assert_eq!(generator_from_env(&env("anthropic"), &config).unwrap().provider(), "anthropic");
        assert_eq!(generator_from_env(&env("groq"), &config).unwrap().provider(), "groq");
    }

    #[test]
    fn test_missing_key_and_unknown_provider() {
        let config = GenerationConfig::default();

        assert!(generator_from_env(&env("openai"), &config).is_err());
        assert!(generator_from_env(&env("cohere"), &config).is_err());
    }
}
