//! HTTP embedding providers: OpenAI and Ollama.

use std::time::Duration;

use async_trait::async_trait;

use super::{EmbeddingError, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::{KbError, Result};

const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";
const OLLAMA_URL: &str = "http://localhost:11434";

fn build_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| KbError::Config(format!("failed to build HTTP client: {}", e)))
}

fn required_model(config: &EmbeddingConfig, provider: &str) -> Result<String> {
    config
        .model
        .clone()
        .ok_or_else(|| KbError::Config(format!("embedding.model required for {} provider", provider)))
}

fn required_dims(config: &EmbeddingConfig, provider: &str) -> Result<usize> {
    match config.dims {
        Some(d) if d > 0 => Ok(d),
        _ => Err(KbError::Config(format!(
            "embedding.dims required for {} provider",
            provider
        ))),
    }
}

fn transport_error(e: reqwest::Error) -> EmbeddingError {
    if e.is_timeout() {
        EmbeddingError::Timeout
    } else {
        EmbeddingError::Transport(e.to_string())
    }
}

/// POST `body` to `url` and return the decoded JSON, classifying failures.
async fn post_json(
    request: reqwest::RequestBuilder,
    body: &serde_json::Value,
) -> std::result::Result<serde_json::Value, EmbeddingError> {
    let response = request
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(transport_error)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(EmbeddingError::Http {
            status: status.as_u16(),
            body,
        });
    }

    response.json().await.map_err(|e| {
        if e.is_timeout() {
            EmbeddingError::Timeout
        } else {
            EmbeddingError::InvalidResponse(e.to_string())
        }
    })
}

fn parse_vector(value: &serde_json::Value) -> std::result::Result<Vec<f32>, EmbeddingError> {
    value
        .as_array()
        .ok_or_else(|| EmbeddingError::InvalidResponse("embedding is not an array".to_string()))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbeddingError::InvalidResponse("non-numeric component".to_string()))
        })
        .collect()
}

fn reject_empty(text: &str) -> std::result::Result<(), EmbeddingError> {
    if text.trim().is_empty() {
        return Err(EmbeddingError::MalformedInput(
            "cannot embed empty text".to_string(),
        ));
    }
    Ok(())
}

// ============ OpenAI ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST /v1/embeddings` with the configured model. Requires the
/// `OPENAI_API_KEY` environment variable. `embedding.url` overrides the
/// endpoint for API-compatible gateways.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// # Errors
    ///
    /// `Config` if `model` or `dims` is missing, or if `OPENAI_API_KEY`
    /// is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = required_model(config, "OpenAI")?;
        let dims = required_dims(config, "OpenAI")?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| KbError::Config("OPENAI_API_KEY environment variable not set".into()))?;
        let url = config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string());

        Ok(Self {
            model,
            dims,
            url,
            api_key,
            client: build_client(config)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        reject_empty(text)?;
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let request = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key));
        let json = post_json(request, &body).await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[0].embedding`.
fn parse_openai_response(
    json: &serde_json::Value,
) -> std::result::Result<Vec<f32>, EmbeddingError> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing data[0].embedding".to_string()))?;
    parse_vector(embedding)
}

// ============ Ollama ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default:
/// `http://localhost:11434`). Requires an embedding model pulled into
/// Ollama (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = required_model(config, "Ollama")?;
        let dims = required_dims(config, "Ollama")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            model,
            dims,
            url,
            client: build_client(config)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        reject_empty(text)?;
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let request = self.client.post(format!("{}/api/embed", self.url));
        let json = post_json(request, &body).await?;
        parse_ollama_response(&json)
    }
}

/// Extract `embeddings[0]`.
fn parse_ollama_response(
    json: &serde_json::Value,
) -> std::result::Result<Vec<f32>, EmbeddingError> {
    let embedding = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing embeddings array".to_string()))?;
    parse_vector(embedding)
}
