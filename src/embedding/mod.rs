//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and the adapters selected at
//! configuration time:
//! - **[`HashProvider`]**: deterministic feature hashing of character
//!   n-grams and words. Offline, dependency-free, good enough for local
//!   smoke tests and for exercising the pipeline.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed`.
//! - **`LocalProvider`**: runs models in-process via fastembed (behind the
//!   `local-embeddings-fastembed` feature).
//!
//! # Provider Selection
//!
//! Use [`create_provider`] to instantiate the provider named by the
//! configuration:
//!
//! ```rust
//! # use kbase::config::EmbeddingConfig;
//! # use kbase::embedding::{create_provider, EmbeddingProvider};
//! let config = EmbeddingConfig::default(); // provider = "hash"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "hash-ngram");
//! ```
//!
//! # Retry Strategy
//!
//! Providers make a single attempt per call. [`embed_with_retry`] wraps a
//! call with bounded exponential backoff:
//! - timeouts, transport errors, HTTP 429 and 5xx → retry
//! - HTTP 4xx (not 429), malformed input or response → fail immediately
//! - backoff: `base`, `2 × base`, `4 × base`, … (exponent capped at 2^5)

mod remote;

#[cfg(feature = "local-embeddings-fastembed")]
mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{KbError, Result};

#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalProvider;
pub use remote::{OllamaProvider, OpenAIProvider};

/// Failure reported by an embedding provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmbeddingError {
    #[error("provider timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl EmbeddingError {
    /// Whether another attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::Timeout | EmbeddingError::Transport(_) => true,
            EmbeddingError::Http { status, .. } => *status == 429 || *status >= 500,
            EmbeddingError::MalformedInput(_) | EmbeddingError::InvalidResponse(_) => false,
        }
    }
}

/// Trait for embedding providers.
///
/// Implementations turn one text into one vector of exactly [`dims`]
/// elements. The knowledge store treats every call as potentially slow and
/// bounds how many run at once.
///
/// [`dims`]: EmbeddingProvider::dims
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a single text.
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError>;
}

/// Bounded retry settings for [`embed_with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_backoff * (1u32 << (attempt - 1).min(5))
    }
}

/// Call `provider.embed` with bounded exponential backoff on retryable errors.
pub async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    text: &str,
    policy: &RetryPolicy,
) -> std::result::Result<Vec<f32>, EmbeddingError> {
    let mut attempt = 0;
    loop {
        match provider.embed(text).await {
            Ok(vector) => return Ok(vector),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                warn!(
                    model = provider.model_name(),
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "embedding call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============ Hash Provider ============

/// Deterministic feature-hashing embedder.
///
/// Character bigrams, trigrams and whitespace-separated words are hashed (FNV-1a)
/// into `dims` buckets with a sign bit, then the vector is L2-normalized.
/// Identical texts always produce identical vectors and texts sharing many
/// n-grams land close together under cosine similarity.
#[derive(Debug, Clone)]
pub struct HashProvider {
    dims: usize,
}

impl HashProvider {
    pub fn new(dims: usize) -> Result<Self> {
        if dims == 0 {
            return Err(KbError::Config("embedding.dims must be > 0".to_string()));
        }
        Ok(Self { dims })
    }

    /// Synchronous core of [`EmbeddingProvider::embed`].
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        let chars: Vec<char> = text.chars().flat_map(char::to_lowercase).collect();

        for n in [2, 3] {
            for gram in chars.windows(n) {
                let key: String = gram.iter().collect();
                self.accumulate(&mut vector, key.as_bytes(), 1.0);
            }
        }
        if chars.len() == 1 {
            let key: String = chars.iter().collect();
            self.accumulate(&mut vector, key.as_bytes(), 1.0);
        }
        for word in text.split_whitespace() {
            self.accumulate(&mut vector, word.to_lowercase().as_bytes(), 2.0);
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }

    fn accumulate(&self, vector: &mut [f32], key: &[u8], weight: f32) {
        let h = fnv1a(key);
        let bucket = (h % self.dims as u64) as usize;
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        "hash-ngram"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Create the [`EmbeddingProvider`] named by the configuration.
///
/// # Supported Providers
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hash"` | [`HashProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (requires `local-embeddings-fastembed`) |
///
/// # Errors
///
/// `Config` for unknown provider names or when the provider cannot be
/// initialized (missing model, dims, API key, or feature flag).
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashProvider::new(config.dims.unwrap_or(384))?)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(KbError::Config(
            "local embedding provider requires --features local-embeddings-fastembed".to_string(),
        )),
        other => Err(KbError::Config(format!(
            "unknown embedding provider: '{}'. Must be hash, openai, ollama, or local.",
            other
        ))),
    }
}
