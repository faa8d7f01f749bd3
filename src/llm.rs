//! Chat-completion provider clients.
//!
//! [`LanguageModel`] takes the role-tagged prompt produced by
//! `docchat_core::prompt::assemble` and returns the model's reply. As with
//! embeddings, clients make one request per call and classify failures;
//! the composer owns retry and timeout policy.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use docchat_core::embedding::ProviderError;
use docchat_core::prompt::PromptMessage;

use crate::config::LlmConfig;
use crate::embedding::{send_json, OLLAMA_DEFAULT_URL, OPENAI_DEFAULT_URL};

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Generate a reply. An empty reply is reported as a permanent error.
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, ProviderError>;
}

fn to_wire(messages: &[PromptMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
        .collect()
}

fn non_empty(text: Option<&str>, service: &str) -> Result<String, ProviderError> {
    match text.map(str::trim) {
        Some(t) if !t.is_empty() => Ok(t.to_string()),
        _ => Err(ProviderError::Permanent(format!(
            "{} returned an empty completion",
            service
        ))),
    }
}

pub struct DisabledLanguageModel;

#[async_trait]
impl LanguageModel for DisabledLanguageModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _messages: &[PromptMessage]) -> Result<String, ProviderError> {
        Err(ProviderError::Permanent("llm provider is disabled".to_string()))
    }
}

/// `POST /v1/chat/completions`, key from `OPENAI_API_KEY`.
pub struct OpenAIChat {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAIChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string()),
            api_key,
            model,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.model,
            "messages": to_wire(messages),
            "temperature": self.temperature,
        });
        let request = self
            .client
            .post(format!(
                "{}/v1/chat/completions",
                self.url.trim_end_matches('/')
            ))
            .bearer_auth(&self.api_key)
            .json(&body);
        let json = send_json("OpenAI", request).await?;
        non_empty(
            json.pointer("/choices/0/message/content")
                .and_then(|v| v.as_str()),
            "OpenAI",
        )
    }
}

/// `POST /api/chat` on a local Ollama instance, non-streaming.
pub struct OllamaChat {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for Ollama provider"))?;
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string()),
            model,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.model,
            "messages": to_wire(messages),
            "stream": false,
            "options": {"temperature": self.temperature},
        });
        let request = self
            .client
            .post(format!("{}/api/chat", self.url.trim_end_matches('/')))
            .json(&body);
        let json = send_json("Ollama", request).await?;
        non_empty(
            json.pointer("/message/content").and_then(|v| v.as_str()),
            "Ollama",
        )
    }
}

pub fn create_language_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledLanguageModel)),
        "openai" => Ok(Arc::new(OpenAIChat::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaChat::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
