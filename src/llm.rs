//! Language-model providers.
//!
//! | Config Value | Provider | Endpoint |
//! |-------------|----------|----------|
//! | `"ollama"` | [`OllamaModel`] | `POST {url}/api/generate`, non-streaming |
//! | `"openai"` | [`OpenAIChatModel`] | `POST /v1/chat/completions` |
//! | `"disabled"` | [`DisabledModel`] | none, every call fails |
//!
//! Model calls are not retried. A failure goes straight back to the caller
//! and has no effect on the cached pipeline.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;

/// A text-generation backend.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier, for logs and status output.
    fn model_name(&self) -> &str;

    /// Generate a completion for a fully assembled prompt.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _prompt: &str) -> Result<String> {
        bail!("Language model provider is disabled")
    }
}

// ============ Ollama ============

pub struct OllamaModel {
    model: String,
    url: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OllamaModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build Ollama HTTP client")?;
        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            temperature: config.temperature,
            client,
        })
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[async_trait]
impl LanguageModel for OllamaModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };
        let resp = self
            .client
            .post(format!("{}/api/generate", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to call Ollama at {}", self.url))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("Ollama returned {}: {}", status, text);
        }
        let parsed: GenerateResponse = resp
            .json()
            .await
            .context("failed to parse Ollama response")?;
        Ok(parsed.response)
    }
}

// ============ OpenAI chat ============

pub struct OpenAIChatModel {
    model: String,
    api_key: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAIChatModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build OpenAI HTTP client")?;
        Ok(Self {
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            client,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

#[async_trait]
impl LanguageModel for OpenAIChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let resp = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(self.api_key.trim())
            .json(&body)
            .send()
            .await
            .context("failed to call OpenAI chat completions")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("OpenAI returned {}: {}", status, text);
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .context("failed to parse OpenAI response")?;
        Ok(parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

/// Create the [`LanguageModel`] named by `config.provider`.
pub fn create_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "ollama" => Ok(Arc::new(OllamaModel::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIChatModel::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_request_shape() {
        let body = GenerateRequest {
            model: "codellama",
            prompt: "hi",
            stream: false,
            options: GenerateOptions { temperature: 0.2 },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "codellama");
        assert_eq!(json["stream"], false);
        assert!((json["options"]["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_chat_response_tolerates_null_content() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":null}},{"message":{"content":"ok"}}]}"#,
        )
        .unwrap();
        let answer = parsed
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .unwrap_or_default();
        assert_eq!(answer, "ok");
    }

    #[tokio::test]
    async fn test_disabled_model_fails() {
        let model = create_model(&LlmConfig {
            provider: "disabled".to_string(),
            ..LlmConfig::default()
        })
        .unwrap();
        assert!(model.generate("anything").await.is_err());
    }

    #[tokio::test]
    async fn test_ollama_unreachable_is_error() {
        let model = OllamaModel::new(&LlmConfig {
            url: Some("http://127.0.0.1:1".to_string()),
            timeout_secs: 2,
            ..LlmConfig::default()
        })
        .unwrap();
        assert!(model.generate("hi").await.is_err());
    }
}
