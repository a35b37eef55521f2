//! Core data models used throughout the knowledge base.
//!
//! These types represent the documents, chunks, and query results that flow
//! through the ingestion and retrieval pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encoding::Encoding;
use crate::error::KbError;

/// Stable identity of an ingested document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id for a document name, so re-ingesting the same
    /// source replaces the earlier version instead of duplicating it.
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()))
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DocumentId {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(DocumentId)
            .map_err(|e| KbError::NotFound(format!("invalid document id '{}': {}", s, e)))
    }
}

/// Identity of a chunk; the key stored in the vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub Uuid);

impl ChunkId {
    /// Derive the id of chunk `seq` of a document version.
    pub fn derive(document_id: DocumentId, version: u32, seq: usize) -> Self {
        let name = format!("{}:{}", version, seq);
        Self(Uuid::new_v5(&document_id.0, name.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller-supplied metadata for an ingest.
#[derive(Debug, Clone, Default)]
pub struct DocumentMeta {
    /// Display name (typically the file path). Also seeds the document id
    /// when `id` is not given.
    pub name: Option<String>,
    /// Explicit id; ingesting under an existing id replaces that document.
    pub id: Option<DocumentId>,
    /// Free-form key/value attributes stored with the document.
    pub attributes: BTreeMap<String, String>,
}

impl DocumentMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Resolve the document id this metadata addresses.
    pub fn document_id(&self) -> DocumentId {
        match (&self.id, &self.name) {
            (Some(id), _) => *id,
            (None, Some(name)) => DocumentId::from_name(name),
            (None, None) => DocumentId::new(),
        }
    }
}

/// An ingested document. Immutable once committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub name: Option<String>,
    /// Label of the encoding the raw bytes were decoded with.
    pub encoding: Encoding,
    /// True when the text came from a lossy fallback decode.
    pub degraded: bool,
    pub byte_len: u64,
    /// SHA-256 of the original bytes, hex encoded.
    pub content_hash: String,
    /// Length of the canonical text, in characters.
    pub char_len: u64,
    pub ingested_at: DateTime<Utc>,
    /// Starts at 1 and increments every time the document is re-ingested.
    pub version: u32,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// A chunk of a document's canonical text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub seq: usize,
    /// Character offset range `[start, end)` into the canonical text.
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// SHA-256 of the chunk text, hex encoded.
    pub hash: String,
}

/// Pipeline stage of a single document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum DocumentState {
    Pending,
    Decoding,
    Chunking,
    Embedding,
    Indexed,
    Failed(String),
    /// Stopped by a cancellation request before committing.
    Cancelled,
}

impl DocumentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentState::Indexed | DocumentState::Failed(_) | DocumentState::Cancelled
        )
    }

    /// Move to `next` if the transition is legal.
    ///
    /// Legal moves are one step forward along the happy path, or from any
    /// non-terminal state into `Failed` or `Cancelled`.
    pub fn advance(&mut self, next: DocumentState) -> bool {
        let ok = match (&*self, &next) {
            (s, _) if s.is_terminal() => false,
            (_, DocumentState::Failed(_) | DocumentState::Cancelled) => true,
            (DocumentState::Pending, DocumentState::Decoding)
            | (DocumentState::Decoding, DocumentState::Chunking)
            | (DocumentState::Chunking, DocumentState::Embedding)
            | (DocumentState::Embedding, DocumentState::Indexed) => true,
            _ => false,
        };
        if ok {
            *self = next;
        }
        ok
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentState::Pending => write!(f, "pending"),
            DocumentState::Decoding => write!(f, "decoding"),
            DocumentState::Chunking => write!(f, "chunking"),
            DocumentState::Embedding => write!(f, "embedding"),
            DocumentState::Indexed => write!(f, "indexed"),
            DocumentState::Failed(reason) => write!(f, "failed: {}", reason),
            DocumentState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A ranked query result with provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryHit {
    pub document_id: DocumentId,
    pub chunk_id: ChunkId,
    pub document_name: Option<String>,
    pub seq: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub score: f32,
}

/// Lightweight listing entry for a stored document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub name: Option<String>,
    pub encoding: Encoding,
    pub degraded: bool,
    pub chunk_count: usize,
    pub version: u32,
    pub ingested_at: DateTime<Utc>,
    /// `Indexed`, or the pipeline stage of a replacement in progress.
    pub state: DocumentState,
}

/// Per-document result of a batch ingest.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentOutcome {
    /// Position of the item in the batch input.
    pub position: usize,
    pub document_id: DocumentId,
    pub name: Option<String>,
    pub state: DocumentState,
    pub chunk_count: usize,
    /// Set when the document was indexed from a lossy decode.
    pub degraded: bool,
}

impl DocumentOutcome {
    pub fn is_indexed(&self) -> bool {
        self.state == DocumentState::Indexed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == DocumentState::Cancelled
    }
}
