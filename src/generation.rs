//! HTTP text-generation providers used for grounded answers and
//! personality extraction.
//!
//! - **[`OpenAIGenerator`]**: `POST {url}/v1/chat/completions`, one user
//!   message, temperature 0.
//! - **[`OllamaGenerator`]**: `POST {url}/api/generate` with `stream: false`.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;

use folio_core::embedding::GenerationProvider;
use folio_core::{Error, Result};

use crate::config::GenerationConfig;
use crate::http::{build_client, openai_api_key, post_json};

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";

pub struct OpenAIGenerator {
    model: String,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig, model: String) -> Result<Self> {
        Ok(Self {
            model,
            url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
            api_key: openai_api_key()?,
            max_retries: config.max_retries,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "messages": [{"role": "user", "content": prompt}],
        });
        let json = post_json(
            &self.client,
            &format!("{}/v1/chat/completions", self.url.trim_end_matches('/')),
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_chat_response(&json)
    }
}

pub struct OllamaGenerator {
    model: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig, model: String) -> Result<Self> {
        Ok(Self {
            model,
            url: config.url.clone().unwrap_or_else(|| OLLAMA_URL.to_string()),
            max_retries: config.max_retries,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {"temperature": 0},
        });
        let json = post_json(
            &self.client,
            &format!("{}/api/generate", self.url.trim_end_matches('/')),
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        parse_ollama_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::ProviderUnavailable("Invalid OpenAI response: missing choices[0].message.content".into())
        })
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<String> {
    json.get("response")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::ProviderUnavailable("Invalid Ollama response: missing response".into()))
}

/// Create the configured generation provider.
pub fn create_generator(config: &GenerationConfig) -> anyhow::Result<Arc<dyn GenerationProvider>> {
    let model = match &config.model {
        Some(m) => m.clone(),
        None if config.is_enabled() => bail!("generation.model is required"),
        None => String::new(),
    };
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config, model)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config, model)?)),
        "disabled" => bail!("generation provider is disabled; set [generation] provider in config"),
        other => bail!("Unknown generation provider: {}", other),
    }
}
