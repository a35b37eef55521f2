//! Error taxonomy for the knowledge base.
//!
//! Every fallible library operation returns [`Result<T>`]. The variants map
//! one-to-one onto the failure classes callers are expected to react to:
//! decode failures (recoverable through a degraded decode), configuration
//! errors, dimension mismatches, embedding provider failures, corrupt
//! snapshots, unknown ids and cancellation.

use thiserror::Error;

use crate::embedding::EmbeddingError;

/// Top-level error type for `kbase`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KbError {
    /// No candidate encoding decoded the input without invalid sequences.
    #[error("decode error: {0}")]
    Decode(String),

    /// Invalid chunking, index, encoding or embedding configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A vector's length disagrees with the index (or provider) dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The embedding provider failed (after retries, where applicable).
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// A persisted snapshot failed validation.
    #[error("corrupt state: {0}")]
    CorruptState(String),

    /// Reference to an unknown document or chunk id.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation observed a cancellation request.
    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for KbError {
    fn from(err: toml::de::Error) -> Self {
        KbError::Config(err.to_string())
    }
}

/// A specialized `Result` type for knowledge-base operations.
pub type Result<T> = std::result::Result<T, KbError>;
