//! HTTP embedding providers.
//!
//! - **[`OpenAIEmbedder`]**: `POST {url}/v1/embeddings`, bearer auth from
//!   `OPENAI_API_KEY`.
//! - **[`OllamaEmbedder`]**: `POST {url}/api/embed` on a local Ollama.
//!
//! Both send one request per batch and fail the batch with
//! `DimensionMismatch` if the service returns vectors of the wrong size.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;

use folio_core::embedding::EmbeddingProvider;
use folio_core::models::EmbeddingModel;
use folio_core::{Error, Result};

use crate::config::EmbeddingConfig;
use crate::http::{build_client, openai_api_key, post_json};

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";

pub struct OpenAIEmbedder {
    model: EmbeddingModel,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig, model: EmbeddingModel) -> Result<Self> {
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
impl EmbeddingProvider for OpenAIEmbedder {
    fn model(&self) -> EmbeddingModel {
        self.model.clone()
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model.name,
            "input": texts,
        });
        let json = post_json(
            &self.client,
            &format!("{}/v1/embeddings", self.url.trim_end_matches('/')),
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        let vectors = parse_openai_response(&json)?;
        check_batch(&self.model, texts.len(), vectors)
    }
}

pub struct OllamaEmbedder {
    model: EmbeddingModel,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig, model: EmbeddingModel) -> Result<Self> {
        Ok(Self {
            model,
            url: config.url.clone().unwrap_or_else(|| OLLAMA_URL.to_string()),
            max_retries: config.max_retries,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn model(&self) -> EmbeddingModel {
        self.model.clone()
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model.name,
            "input": texts,
        });
        let json = post_json(
            &self.client,
            &format!("{}/api/embed", self.url.trim_end_matches('/')),
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        let vectors = parse_ollama_response(&json)?;
        check_batch(&self.model, texts.len(), vectors)
    }
}

fn check_batch(
    model: &EmbeddingModel,
    expected: usize,
    vectors: Vec<Vec<f32>>,
) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(Error::ProviderUnavailable(format!(
            "expected {} embeddings, got {}",
            expected,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != model.dims) {
        return Err(Error::DimensionMismatch {
            context: format!("embedding response from {}", model.name),
            expected: model.dims,
            actual: bad.len(),
        });
    }
    Ok(vectors)
}

fn floats(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::ProviderUnavailable("Invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (i, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::ProviderUnavailable("Invalid OpenAI response: missing embedding".into()))?;
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(i);
        indexed.push((index, floats(embedding)));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            Error::ProviderUnavailable("Invalid Ollama response: missing embeddings array".into())
        })?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding.as_array().map(|a| floats(a)).ok_or_else(|| {
                Error::ProviderUnavailable("Invalid Ollama response: embedding is not an array".into())
            })
        })
        .collect()
}

/// Create the configured embedding provider.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
///
/// `"disabled"` is an error: ingestion and chat both need embeddings.
pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    if !config.is_enabled() {
        bail!("embedding provider is disabled; set [embedding] provider in config");
    }
    let model = match (&config.model, config.dims) {
        (Some(name), Some(dims)) => EmbeddingModel::new(name.clone(), dims),
        _ => bail!("embedding.model and embedding.dims are required"),
    };
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config, model)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config, model)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
