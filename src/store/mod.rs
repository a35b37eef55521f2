//! The knowledge store: documents, chunks and the vector index behind one
//! lock.
//!
//! A [`KnowledgeStore`] owns everything a knowledge base holds. Mutations
//! (ingest commits, removals, compaction, reloads) take the write half of a
//! `tokio::sync::RwLock`; queries and listings take the read half and run
//! concurrently. Embedding calls happen outside the lock.
//!
//! # Lifecycle
//!
//! ```text
//! KnowledgeStore::open(config, provider)
//!   ├── snapshot exists → load + validate
//!   └── otherwise      → empty store
//! ingest / ingest_batch / remove / compact   (write lock per commit)
//! query / documents / preview / stats        (read lock)
//! save(path)                                 (read lock, atomic file write)
//! ```

mod ingest;
pub mod snapshot;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use tracing::{info, warn};

use crate::chunk::Chunker;
use crate::config::Config;
use crate::embedding::{EmbeddingProvider, RetryPolicy};
use crate::encoding::EncodingDetector;
use crate::error::{KbError, Result};
use crate::index::{IndexConfig, IndexMode, Metric, VectorIndex};
use crate::models::{Chunk, ChunkId, Document, DocumentId, DocumentState, DocumentSummary, QueryHit};
use crate::progress::{NoProgress, ProgressReporter};

pub use ingest::{CancelToken, IngestItem};
use snapshot::{DocumentRecord, SnapshotMeta};

/// Everything guarded by the store lock.
struct StoreState {
    documents: HashMap<DocumentId, DocumentRecord>,
    /// Chunk id → (document, position in its chunk list).
    owners: HashMap<ChunkId, (DocumentId, usize)>,
    index: VectorIndex,
}

impl StoreState {
    fn empty(index_config: IndexConfig) -> Result<Self> {
        Ok(Self {
            documents: HashMap::new(),
            owners: HashMap::new(),
            index: VectorIndex::new(index_config)?,
        })
    }

    /// Rebuild state from a decoded snapshot, cross-checking metadata
    /// against the index.
    fn from_snapshot(
        meta: SnapshotMeta,
        index_bytes: &[u8],
        index_config: IndexConfig,
        provider: &dyn EmbeddingProvider,
    ) -> Result<Self> {
        if meta.dims != provider.dims() {
            return Err(KbError::CorruptState(format!(
                "snapshot dimension {} does not match provider dimension {}",
                meta.dims,
                provider.dims()
            )));
        }
        if meta.model != provider.model_name() {
            warn!(
                snapshot_model = %meta.model,
                provider_model = provider.model_name(),
                "snapshot was built with a different embedding model"
            );
        }

        let index = VectorIndex::from_bytes(index_bytes, index_config)?;
        if let Some(dim) = index.dimension() {
            if dim != provider.dims() {
                return Err(KbError::CorruptState(format!(
                    "index dimension {} does not match provider dimension {}",
                    dim,
                    provider.dims()
                )));
            }
        }

        let mut documents = HashMap::with_capacity(meta.documents.len());
        let mut owners = HashMap::new();
        for record in meta.documents {
            let id = record.document.id;
            for (pos, chunk) in record.chunks.iter().enumerate() {
                if chunk.document_id != id || !index.contains(&chunk.id) {
                    return Err(KbError::CorruptState(format!(
                        "chunk {} of document {} has no vector in the index",
                        chunk.id, id
                    )));
                }
                if owners.insert(chunk.id, (id, pos)).is_some() {
                    return Err(KbError::CorruptState(format!(
                        "chunk {} listed twice",
                        chunk.id
                    )));
                }
            }
            if documents.insert(id, record).is_some() {
                return Err(KbError::CorruptState(format!("document {} listed twice", id)));
            }
        }
        if owners.len() != index.len() {
            return Err(KbError::CorruptState(format!(
                "index holds {} vectors but metadata references {} chunks",
                index.len(),
                owners.len()
            )));
        }

        Ok(Self {
            documents,
            owners,
            index,
        })
    }

    /// Take a document's vectors out of the index, returning them for a
    /// possible rollback.
    fn detach(&mut self, record: &DocumentRecord) -> Result<Vec<(ChunkId, Vec<f32>)>> {
        let mut detached = Vec::with_capacity(record.chunks.len());
        for chunk in &record.chunks {
            self.owners.remove(&chunk.id);
            if let Some(vector) = self.index.get(&chunk.id).map(<[f32]>::to_vec) {
                self.index.remove(&chunk.id)?;
                detached.push((chunk.id, vector));
            }
        }
        Ok(detached)
    }

    fn attach_owners(&mut self, record: &DocumentRecord) {
        for (pos, chunk) in record.chunks.iter().enumerate() {
            self.owners.insert(chunk.id, (record.document.id, pos));
        }
    }

    fn rebuild_if_needed(&mut self) {
        if self.index.needs_rebuild() {
            let tombstones = self.index.tombstones();
            self.index.rebuild();
            info!(reclaimed = tombstones, "rebuilt vector index after deletions");
        }
    }
}

/// Aggregate numbers for `kb stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub documents: usize,
    pub chunks: usize,
    pub vectors: usize,
    pub tombstones: usize,
    pub degraded_documents: usize,
    pub dimension: usize,
    pub metric: Metric,
    pub mode: IndexMode,
    pub model: String,
    pub snapshot_path: PathBuf,
}

/// Owns all documents, chunks and the vector index of one knowledge base.
pub struct KnowledgeStore {
    snapshot_path: PathBuf,
    detector: EncodingDetector,
    allow_degraded: bool,
    chunker: Chunker,
    provider: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
    embed_permits: Semaphore,
    /// Chunks of one document embedded at once.
    embed_fanout: usize,
    ingest_workers: usize,
    index_config: IndexConfig,
    state: RwLock<StoreState>,
    in_flight: Mutex<HashMap<DocumentId, DocumentState>>,
    progress: Arc<dyn ProgressReporter>,
}

impl KnowledgeStore {
    /// Create an empty store.
    ///
    /// # Errors
    ///
    /// `Config` when the configuration fails validation.
    pub fn new(config: &Config, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        config.validate()?;
        let index_config = IndexConfig {
            dimension: Some(provider.dims()),
            ..config.index_config()
        };
        Ok(Self {
            snapshot_path: config.store.path.clone(),
            detector: config.detector()?,
            allow_degraded: config.encoding.allow_degraded,
            chunker: Chunker::new(config.chunk_config())?,
            retry: config.retry_policy(),
            embed_permits: Semaphore::new(config.ingest.embedding_concurrency),
            embed_fanout: config.ingest.embedding_concurrency,
            ingest_workers: config.ingest.ingest_workers,
            state: RwLock::new(StoreState::empty(index_config.clone())?),
            index_config,
            provider,
            in_flight: Mutex::new(HashMap::new()),
            progress: Arc::new(NoProgress),
        })
    }

    /// Create a store and load the configured snapshot when it exists.
    pub async fn open(config: &Config, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let store = Self::new(config, provider)?;
        if store.snapshot_path.exists() {
            let path = store.snapshot_path.clone();
            store.load(&path).await?;
        }
        Ok(store)
    }

    pub fn with_progress(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress = reporter;
        self
    }

    pub fn provider(&self) -> &dyn EmbeddingProvider {
        self.provider.as_ref()
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Remove a document with all of its chunks and vectors.
    ///
    /// # Errors
    ///
    /// `NotFound` when no document has this id.
    pub async fn remove(&self, id: DocumentId) -> Result<()> {
        let mut state = self.state.write().await;
        let record = state
            .documents
            .remove(&id)
            .ok_or_else(|| KbError::NotFound(format!("document {}", id)))?;
        let detached = state.detach(&record)?;
        state.rebuild_if_needed();
        info!(document = %id, chunks = detached.len(), "removed document");
        Ok(())
    }

    /// Top `k` chunks for `text`, ranked by the index.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<QueryHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embed_text(text).await?;

        let state = self.state.read().await;
        let ranked = state.index.search(&vector, k)?;
        Ok(ranked
            .into_iter()
            .filter_map(|(chunk_id, score)| {
                let (doc_id, pos) = state.owners.get(&chunk_id)?;
                let record = state.documents.get(doc_id)?;
                let chunk = record.chunks.get(*pos)?;
                Some(QueryHit {
                    document_id: *doc_id,
                    chunk_id,
                    document_name: record.document.name.clone(),
                    seq: chunk.seq,
                    start: chunk.start,
                    end: chunk.end,
                    text: chunk.text.clone(),
                    score,
                })
            })
            .collect())
    }

    /// Write a consistent snapshot of metadata and index to `path`.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = {
            let state = self.state.read().await;
            let mut documents: Vec<DocumentRecord> = state.documents.values().cloned().collect();
            documents.sort_by_key(|r| (r.document.ingested_at, r.document.id));
            let meta = SnapshotMeta {
                writer: format!("kbase {}", env!("CARGO_PKG_VERSION")),
                model: self.provider.model_name().to_string(),
                dims: self.provider.dims(),
                metric: state.index.metric(),
                mode: state.index.mode(),
                saved_at: chrono::Utc::now(),
                documents,
            };
            snapshot::encode(&meta, &state.index.to_bytes())?
        };

        let target = path.to_path_buf();
        let len = bytes.len();
        tokio::task::spawn_blocking(move || snapshot::write_atomic(&target, &bytes))
            .await
            .map_err(|e| KbError::Io(std::io::Error::other(e)))??;
        info!(path = %path.display(), bytes = len, "saved snapshot");
        Ok(())
    }

    /// Save to the configured snapshot path.
    pub async fn persist(&self) -> Result<()> {
        let path = self.snapshot_path.clone();
        self.save(&path).await
    }

    /// Replace the in-memory state with the snapshot at `path`.
    ///
    /// The snapshot is fully validated before the swap; on any error the
    /// current state stays in place.
    ///
    /// # Errors
    ///
    /// `CorruptState` on bad magic, unknown version, checksum mismatch,
    /// dimension mismatch with the provider, or metadata/index
    /// disagreement. `Io` when the file cannot be read.
    pub async fn load(&self, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        let (meta, index_bytes) = snapshot::decode(&bytes)?;
        if meta.metric != self.index_config.metric || meta.mode != self.index_config.mode {
            warn!(
                snapshot_metric = %meta.metric,
                snapshot_mode = %meta.mode,
                "snapshot metric/mode differ from configuration; keeping the snapshot's"
            );
        }
        let loaded = StoreState::from_snapshot(
            meta,
            index_bytes,
            self.index_config.clone(),
            self.provider.as_ref(),
        )?;

        let documents = loaded.documents.len();
        *self.state.write().await = loaded;
        info!(path = %path.display(), documents, "loaded snapshot");
        Ok(())
    }

    /// Reload from the configured snapshot path.
    pub async fn reload(&self) -> Result<()> {
        let path = self.snapshot_path.clone();
        self.load(&path).await
    }

    /// All stored documents, ordered by name then id.
    pub async fn documents(&self) -> Vec<DocumentSummary> {
        let in_flight: HashMap<DocumentId, DocumentState> = self.in_flight().into_iter().collect();
        let state = self.state.read().await;
        let mut out: Vec<DocumentSummary> = state
            .documents
            .values()
            .map(|r| DocumentSummary {
                id: r.document.id,
                name: r.document.name.clone(),
                encoding: r.document.encoding,
                degraded: r.document.degraded,
                chunk_count: r.chunks.len(),
                version: r.document.version,
                ingested_at: r.document.ingested_at,
                state: in_flight
                    .get(&r.document.id)
                    .cloned()
                    .unwrap_or(DocumentState::Indexed),
            })
            .collect();
        out.sort_by(|a, b| (&a.name, a.id).cmp(&(&b.name, b.id)));
        out
    }

    pub async fn document(&self, id: DocumentId) -> Result<Document> {
        let state = self.state.read().await;
        state
            .documents
            .get(&id)
            .map(|r| r.document.clone())
            .ok_or_else(|| KbError::NotFound(format!("document {}", id)))
    }

    pub async fn chunks(&self, id: DocumentId) -> Result<Vec<Chunk>> {
        let state = self.state.read().await;
        state
            .documents
            .get(&id)
            .map(|r| r.chunks.clone())
            .ok_or_else(|| KbError::NotFound(format!("document {}", id)))
    }

    /// The first `max_chars` characters of a document's canonical text,
    /// stitched back together from its chunks. Whitespace runs that were
    /// not stored as chunks come back as spaces.
    pub async fn preview(&self, id: DocumentId, max_chars: usize) -> Result<String> {
        let state = self.state.read().await;
        let record = state
            .documents
            .get(&id)
            .ok_or_else(|| KbError::NotFound(format!("document {}", id)))?;

        let mut out = String::new();
        let mut covered = 0;
        let mut taken = 0;
        for chunk in &record.chunks {
            if taken >= max_chars {
                break;
            }
            if chunk.end <= covered {
                continue;
            }
            if chunk.start > covered {
                let gap = (chunk.start - covered).min(max_chars - taken);
                out.extend(std::iter::repeat(' ').take(gap));
                taken += gap;
                if taken >= max_chars {
                    break;
                }
            }
            let skip = covered.saturating_sub(chunk.start);
            for c in chunk.text.chars().skip(skip).take(max_chars - taken) {
                out.push(c);
                taken += 1;
            }
            covered = chunk.end;
        }
        Ok(out)
    }

    pub async fn stats(&self) -> StoreStats {
        let state = self.state.read().await;
        StoreStats {
            documents: state.documents.len(),
            chunks: state.owners.len(),
            vectors: state.index.len(),
            tombstones: state.index.tombstones(),
            degraded_documents: state
                .documents
                .values()
                .filter(|r| r.document.degraded)
                .count(),
            dimension: state.index.dimension().unwrap_or(self.provider.dims()),
            metric: state.index.metric(),
            mode: state.index.mode(),
            model: self.provider.model_name().to_string(),
            snapshot_path: self.snapshot_path.clone(),
        }
    }

    /// Drop tombstones and retrain the index. Returns reclaimed slots.
    pub async fn compact(&self) -> usize {
        let mut state = self.state.write().await;
        let reclaimed = state.index.tombstones();
        state.index.rebuild();
        info!(reclaimed, "compacted vector index");
        reclaimed
    }

    /// Documents currently moving through the pipeline and their stage.
    pub fn in_flight(&self) -> Vec<(DocumentId, DocumentState)> {
        self.in_flight
            .lock()
            .map(|map| map.iter().map(|(id, s)| (*id, s.clone())).collect())
            .unwrap_or_default()
    }
}
