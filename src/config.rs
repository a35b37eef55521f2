//! TOML configuration.
//!
//! Every section and field has a default except `store.path`. Values are
//! validated once in [`load_config`] (or [`Config::validate`] for configs
//! built in code) so the pipeline never sees an inconsistent setting.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::chunk::{BoundaryPolicy, ChunkConfig};
use crate::embedding::RetryPolicy;
use crate::encoding::{Candidate, EncodingDetector};
use crate::error::{KbError, Result};
use crate::index::{IndexConfig, IndexMode, Metric};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub index: IndexSection,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Snapshot file.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default)]
    pub boundary_policy: BoundaryPolicy,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            overlap: default_overlap(),
            boundary_policy: BoundaryPolicy::default(),
        }
    }
}

fn default_max_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexSection {
    #[serde(default)]
    pub similarity_metric: Metric,
    #[serde(default)]
    pub mode: IndexMode,
    #[serde(default)]
    pub strict_remove: bool,
    #[serde(default = "default_nlist")]
    pub nlist: usize,
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,
    #[serde(default = "default_rebuild_threshold")]
    pub rebuild_threshold: f32,
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            similarity_metric: Metric::default(),
            mode: IndexMode::default(),
            strict_remove: false,
            nlist: default_nlist(),
            nprobe: default_nprobe(),
            rebuild_threshold: default_rebuild_threshold(),
        }
    }
}

fn default_nlist() -> usize {
    16
}
fn default_nprobe() -> usize {
    4
}
fn default_rebuild_threshold() -> f32 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EncodingConfig {
    #[serde(default = "Candidate::defaults")]
    pub candidates: Vec<Candidate>,
    #[serde(default = "default_true")]
    pub allow_degraded: bool,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            candidates: Candidate::defaults(),
            allow_degraded: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Endpoint override (Ollama base URL or OpenAI-compatible endpoint).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_embedding_concurrency")]
    pub embedding_concurrency: usize,
    #[serde(default = "default_ingest_workers")]
    pub ingest_workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            embedding_concurrency: default_embedding_concurrency(),
            ingest_workers: default_ingest_workers(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_embedding_concurrency() -> usize {
    4
}
fn default_ingest_workers() -> usize {
    2
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.txt".to_string(), "**/*.md".to_string()]
}

impl Config {
    /// Defaults everywhere, snapshot at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig { path: path.into() },
            chunking: ChunkingConfig::default(),
            index: IndexSection::default(),
            encoding: EncodingConfig::default(),
            embedding: EmbeddingConfig::default(),
            ingest: IngestConfig::default(),
        }
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            max_chunk_size: self.chunking.max_chunk_size,
            overlap_size: self.chunking.overlap,
            boundary_policy: self.chunking.boundary_policy,
        }
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            metric: self.index.similarity_metric,
            mode: self.index.mode,
            dimension: None,
            strict_remove: self.index.strict_remove,
            nlist: self.index.nlist,
            nprobe: self.index.nprobe,
            rebuild_threshold: self.index.rebuild_threshold,
        }
    }

    pub fn detector(&self) -> Result<EncodingDetector> {
        EncodingDetector::new(self.encoding.candidates.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.ingest.max_retries,
            base_backoff: Duration::from_millis(self.ingest.retry_backoff_ms),
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_chunk_size == 0 {
            return Err(KbError::Config("chunking.max_chunk_size must be > 0".into()));
        }
        if self.chunking.overlap >= self.chunking.max_chunk_size {
            return Err(KbError::Config(format!(
                "chunking.overlap ({}) must be smaller than chunking.max_chunk_size ({})",
                self.chunking.overlap, self.chunking.max_chunk_size
            )));
        }

        self.index_config().validate()?;
        self.detector()?;

        match self.embedding.provider.as_str() {
            "hash" | "local" => {}
            "openai" | "ollama" => {
                if self.embedding.dims.unwrap_or(0) == 0 {
                    return Err(KbError::Config(format!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    )));
                }
                if self.embedding.model.is_none() {
                    return Err(KbError::Config(format!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    )));
                }
            }
            other => {
                return Err(KbError::Config(format!(
                    "unknown embedding provider: '{}'. Must be hash, openai, ollama, or local.",
                    other
                )))
            }
        }
        if self.embedding.dims == Some(0) {
            return Err(KbError::Config("embedding.dims must be > 0".into()));
        }
        if self.embedding.timeout_secs == 0 {
            return Err(KbError::Config("embedding.timeout_secs must be > 0".into()));
        }

        if self.ingest.embedding_concurrency == 0 {
            return Err(KbError::Config(
                "ingest.embedding_concurrency must be >= 1".into(),
            ));
        }
        if self.ingest.ingest_workers == 0 {
            return Err(KbError::Config("ingest.ingest_workers must be >= 1".into()));
        }
        Ok(())
    }
}

/// Read, parse and validate a TOML config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        KbError::Config(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
