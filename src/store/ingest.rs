//! Ingestion pipeline: decode → chunk → embed → commit.
//!
//! Each document moves through [`DocumentState`] one stage at a time. Its
//! chunks and vectors are buffered and only committed, under the store's
//! write lock, once every stage has succeeded; a failure or cancellation
//! leaves nothing of the document visible. Re-ingesting an existing id
//! replaces the previous version in the same commit.
//!
//! Batches run up to `ingest_workers` documents at once. A document's
//! chunks are embedded concurrently, and embedding calls across all
//! documents share one semaphore of `embedding_concurrency` permits.
//!
//! Whitespace-only spans carry nothing to embed and are dropped before the
//! embedding stage; every stored chunk has exactly one vector.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::snapshot::DocumentRecord;
use super::KnowledgeStore;
use crate::embedding::embed_with_retry;
use crate::error::{KbError, Result};
use crate::models::{
    Chunk, ChunkId, Document, DocumentId, DocumentMeta, DocumentOutcome, DocumentState,
};
use crate::progress::{ProgressEvent, Stage};

/// Cooperative cancellation flag shared between a caller and a batch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One input of [`KnowledgeStore::ingest_batch`].
#[derive(Debug, Clone)]
pub struct IngestItem {
    pub bytes: Vec<u8>,
    pub meta: DocumentMeta,
}

impl IngestItem {
    pub fn new(bytes: impl Into<Vec<u8>>, meta: DocumentMeta) -> Self {
        Self {
            bytes: bytes.into(),
            meta,
        }
    }
}

/// A fully processed document waiting for commit.
struct Prepared {
    document: Document,
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
}

impl Prepared {
    /// Renumber to `version`, re-deriving chunk ids.
    fn rebase(&mut self, version: u32) {
        self.document.version = version;
        for chunk in &mut self.chunks {
            chunk.id = ChunkId::derive(chunk.document_id, version, chunk.seq);
        }
    }
}

/// What a successful pipeline run committed.
struct Committed {
    chunk_count: usize,
    degraded: bool,
}

impl KnowledgeStore {
    /// Ingest one document.
    ///
    /// # Errors
    ///
    /// Whatever stage failed: `Decode` (only when degraded decoding is
    /// disabled), `Embedding` after retries, `DimensionMismatch`. Nothing of
    /// the document is visible afterwards.
    pub async fn ingest(&self, bytes: &[u8], meta: DocumentMeta) -> Result<DocumentId> {
        let id = meta.document_id();
        self.run_pipeline(id, bytes, meta, &CancelToken::new())
            .await
            .map(|_| id)
    }

    /// Ingest many documents concurrently, one outcome per input in input
    /// order. A failing document never aborts the others; once `cancel` is
    /// triggered, documents not yet committed finish as `Cancelled`.
    pub async fn ingest_batch(
        &self,
        items: Vec<IngestItem>,
        cancel: &CancelToken,
    ) -> Vec<DocumentOutcome> {
        let total = items.len();
        let outcomes: Vec<DocumentOutcome> = stream::iter(items.into_iter().enumerate())
            .map(|(position, item)| self.ingest_item(position, item, cancel))
            .buffered(self.ingest_workers)
            .collect()
            .await;

        let indexed = outcomes.iter().filter(|o| o.is_indexed()).count();
        let cancelled = outcomes.iter().filter(|o| o.is_cancelled()).count();
        info!(
            total,
            indexed,
            failed = total - indexed - cancelled,
            cancelled,
            "batch ingest finished"
        );
        outcomes
    }

    async fn ingest_item(
        &self,
        position: usize,
        item: IngestItem,
        cancel: &CancelToken,
    ) -> DocumentOutcome {
        let document_id = item.meta.document_id();
        let name = item.meta.name.clone();

        let result = if cancel.is_cancelled() {
            self.progress
                .report(ProgressEvent::new(Stage::Cancelled, document_id, 100));
            Err(KbError::Cancelled)
        } else {
            self.run_pipeline(document_id, &item.bytes, item.meta, cancel)
                .await
        };

        let (state, chunk_count, degraded) = match result {
            Ok(c) => (DocumentState::Indexed, c.chunk_count, c.degraded),
            Err(KbError::Cancelled) => (DocumentState::Cancelled, 0, false),
            Err(e) => (DocumentState::Failed(e.to_string()), 0, false),
        };
        DocumentOutcome {
            position,
            document_id,
            name,
            state,
            chunk_count,
            degraded,
        }
    }

    /// Drive one document through every stage, tracking its state.
    async fn run_pipeline(
        &self,
        id: DocumentId,
        bytes: &[u8],
        meta: DocumentMeta,
        cancel: &CancelToken,
    ) -> Result<Committed> {
        let mut state = DocumentState::Pending;
        self.track(id, &state);

        let result = self.pipeline(id, bytes, meta, cancel, &mut state).await;
        match &result {
            Ok(_) => {}
            Err(KbError::Cancelled) => {
                state.advance(DocumentState::Cancelled);
                debug!(document = %id, "ingest cancelled");
                self.progress
                    .report(ProgressEvent::new(Stage::Cancelled, id, 100));
            }
            Err(e) => {
                state.advance(DocumentState::Failed(e.to_string()));
                warn!(document = %id, error = %e, "ingest failed");
                self.progress.report(ProgressEvent::new(Stage::Failed, id, 100));
            }
        }
        if let Ok(mut map) = self.in_flight.lock() {
            map.remove(&id);
        }
        result
    }

    fn track(&self, id: DocumentId, state: &DocumentState) {
        if let Ok(mut map) = self.in_flight.lock() {
            map.insert(id, state.clone());
        }
    }

    fn enter(
        &self,
        id: DocumentId,
        state: &mut DocumentState,
        next: DocumentState,
        stage: Stage,
        percent: u8,
    ) {
        if state.advance(next) {
            self.track(id, state);
            self.progress.report(ProgressEvent::new(stage, id, percent));
        }
    }

    async fn pipeline(
        &self,
        id: DocumentId,
        bytes: &[u8],
        meta: DocumentMeta,
        cancel: &CancelToken,
        state: &mut DocumentState,
    ) -> Result<Committed> {
        self.enter(id, state, DocumentState::Decoding, Stage::Decoding, 0);
        let decoded = self.detector.decode(bytes, self.allow_degraded)?;
        if decoded.degraded {
            warn!(
                document = %id,
                name = meta.name.as_deref().unwrap_or("-"),
                encoding = %decoded.encoding,
                "no candidate encoding validated; indexing a lossy decode"
            );
        }

        self.enter(id, state, DocumentState::Chunking, Stage::Chunking, 20);
        let version = self.next_version(id).await;
        let mut blank = 0;
        let chunks: Vec<Chunk> = self
            .chunker
            .chunks(&decoded.text)
            .filter(|span| {
                let keep = !span.text.trim().is_empty();
                blank += usize::from(!keep);
                keep
            })
            .map(|span| span.into_chunk(id, version))
            .collect();
        if blank > 0 {
            debug!(document = %id, skipped = blank, "dropped whitespace-only spans");
        }

        self.enter(id, state, DocumentState::Embedding, Stage::Embedding, 30);
        let total = chunks.len();
        let done = AtomicUsize::new(0);
        let done = &done;
        let vectors: Vec<Vec<f32>> = stream::iter(chunks.iter())
            .map(|chunk| async move {
                if cancel.is_cancelled() {
                    return Err(KbError::Cancelled);
                }
                let vector = self.embed_text(&chunk.text).await?;
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(document = %id, seq = chunk.seq, chars = chunk.end - chunk.start, "embedded chunk");
                self.progress
                    .report(ProgressEvent::embedding(id, finished, total));
                Ok(vector)
            })
            .buffered(self.embed_fanout)
            .try_collect()
            .await?;
        if cancel.is_cancelled() {
            return Err(KbError::Cancelled);
        }

        let content_hash = format!("{:x}", Sha256::digest(bytes));
        let document = Document {
            id,
            name: meta.name,
            encoding: decoded.encoding,
            degraded: decoded.degraded,
            byte_len: bytes.len() as u64,
            content_hash,
            char_len: decoded.text.chars().count() as u64,
            ingested_at: Utc::now(),
            version,
            attributes: meta.attributes,
        };
        let chunk_count = chunks.len();
        let degraded = document.degraded;
        let committed_version = self
            .commit(Prepared {
                document,
                chunks,
                vectors,
            })
            .await?;

        self.enter(id, state, DocumentState::Indexed, Stage::Indexed, 100);
        info!(
            document = %id,
            chunks = chunk_count,
            version = committed_version,
            degraded,
            "indexed document"
        );
        Ok(Committed {
            chunk_count,
            degraded,
        })
    }

    async fn next_version(&self, id: DocumentId) -> u32 {
        let state = self.state.read().await;
        state
            .documents
            .get(&id)
            .map(|r| r.document.version + 1)
            .unwrap_or(1)
    }

    /// Embed under the shared concurrency limit, with retries.
    pub(crate) async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let vector = {
            let _permit = self
                .embed_permits
                .acquire()
                .await
                .map_err(|_| KbError::Cancelled)?;
            embed_with_retry(self.provider.as_ref(), text, &self.retry).await?
        };
        let expected = self.provider.dims();
        if vector.len() != expected {
            return Err(KbError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    /// Atomically swap the document's previous version (if any) for the
    /// prepared one. Returns the committed version.
    async fn commit(&self, mut prepared: Prepared) -> Result<u32> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        if let Some(expected) = state.index.dimension() {
            if let Some(v) = prepared.vectors.iter().find(|v| v.len() != expected) {
                return Err(KbError::DimensionMismatch {
                    expected,
                    actual: v.len(),
                });
            }
        }

        let id = prepared.document.id;
        if let Some(current) = state.documents.get(&id).map(|r| r.document.version) {
            if current >= prepared.document.version {
                prepared.rebase(current + 1);
            }
        }

        let previous = state.documents.remove(&id);
        let detached = match &previous {
            Some(record) => state.detach(record)?,
            None => Vec::new(),
        };

        let mut inserted: Vec<ChunkId> = Vec::with_capacity(prepared.chunks.len());
        for (chunk, vector) in prepared.chunks.iter().zip(prepared.vectors) {
            if let Err(e) = state.index.insert(chunk.id, vector) {
                for chunk_id in &inserted {
                    state.index.remove(chunk_id)?;
                }
                for (chunk_id, vector) in detached {
                    state.index.insert(chunk_id, vector)?;
                }
                if let Some(record) = previous {
                    state.attach_owners(&record);
                    state.documents.insert(id, record);
                }
                return Err(e);
            }
            inserted.push(chunk.id);
        }

        let record = DocumentRecord {
            document: prepared.document,
            chunks: prepared.chunks,
        };
        let version = record.document.version;
        state.attach_owners(&record);
        state.documents.insert(id, record);
        if previous.is_some() {
            debug!(document = %id, version, "replaced previous version");
        }
        state.rebuild_if_needed();
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::{EmbeddingError, EmbeddingProvider, HashProvider};
    use crate::progress::ChannelProgress;
    use async_trait::async_trait;

    /// Hash embeddings, except texts containing `poison` fail permanently.
    /// Blank text is rejected the way the HTTP providers reject it.
    struct Poisoned {
        inner: HashProvider,
        poison: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for Poisoned {
        fn model_name(&self) -> &str {
            "hash-ngram"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text.trim().is_empty() {
                return Err(EmbeddingError::MalformedInput("blank".into()));
            }
            if text.contains(self.poison) {
                return Err(EmbeddingError::Http {
                    status: 400,
                    body: "rejected".into(),
                });
            }
            Ok(self.inner.embed_sync(text))
        }
    }

    fn config() -> Config {
        let mut config = Config::new("unused.snapshot");
        config.chunking.max_chunk_size = 10;
        config.chunking.overlap = 0;
        config.chunking.boundary_policy = crate::chunk::BoundaryPolicy::Char;
        config.ingest.retry_backoff_ms = 1;
        config
    }

    fn poisoned(poison: &'static str) -> Arc<Poisoned> {
        Arc::new(Poisoned {
            inner: HashProvider::new(16).unwrap(),
            poison,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_failure_on_third_of_five_chunks_commits_nothing() {
        let store = KnowledgeStore::new(&config(), poisoned("XX")).unwrap();
        // Five 10-char chunks; the third carries the poison marker.
        let text = "aaaaaaaaaabbbbbbbbbbccccXXccccddddddddddeeeeeeeeee";
        let err = store
            .ingest(text.as_bytes(), DocumentMeta::named("five.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, KbError::Embedding(EmbeddingError::Http { status: 400, .. })));
        assert!(store.documents().await.is_empty());
        assert_eq!(store.stats().await.vectors, 0);
        assert!(store.in_flight().is_empty());
    }

    /// Hash embeddings that trigger `token` when embedding text containing
    /// `marker`.
    struct Tripwire {
        inner: HashProvider,
        marker: &'static str,
        token: CancelToken,
    }

    #[async_trait]
    impl EmbeddingProvider for Tripwire {
        fn model_name(&self) -> &str {
            "hash-ngram"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            if text.contains(self.marker) {
                self.token.cancel();
            }
            Ok(self.inner.embed_sync(text))
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_document_discards_it_and_keeps_committed() {
        let mut config = config();
        config.ingest.embedding_concurrency = 1;
        let cancel = CancelToken::new();
        let store = KnowledgeStore::new(
            &config,
            Arc::new(Tripwire {
                inner: HashProvider::new(16).unwrap(),
                marker: "STOP",
                token: cancel.clone(),
            }),
        )
        .unwrap();
        let kept = store
            .ingest(b"committed before cancel", DocumentMeta::named("kept"))
            .await
            .unwrap();
        let kept_vectors = store.stats().await.vectors;

        // Five 10-char chunks; embedding the third trips the token.
        let text = "aaaaaaaaaabbbbbbbbbbccSTOPccccddddddddddeeeeeeeeee";
        let items = vec![IngestItem::new(text, DocumentMeta::named("halted"))];
        let outcomes = store.ingest_batch(items, &cancel).await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_cancelled());
        assert!(matches!(
            store.document(outcomes[0].document_id).await,
            Err(KbError::NotFound(_))
        ));
        assert_eq!(store.stats().await.vectors, kept_vectors);
        assert_eq!(store.documents().await.len(), 1);
        assert_eq!(store.query("committed", 1).await.unwrap()[0].document_id, kept);
        assert!(store.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_whitespace_run_does_not_reach_provider() {
        let mut config = config();
        config.chunking.max_chunk_size = 1000;
        config.chunking.overlap = 100;
        config.chunking.boundary_policy = crate::chunk::BoundaryPolicy::Word;
        let store = KnowledgeStore::new(&config, poisoned("XX")).unwrap();

        let text = format!("a{}b", " ".repeat(2500));
        let id = store
            .ingest(text.as_bytes(), DocumentMeta::named("spaced.txt"))
            .await
            .unwrap();
        let chunks = store.chunks(id).await.unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| !c.text.trim().is_empty()));
        assert_eq!(store.stats().await.vectors, chunks.len());
        assert_eq!(store.preview(id, 10_000).await.unwrap(), text);
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let store = KnowledgeStore::new(&config(), poisoned("XX")).unwrap();
        let items = vec![
            IngestItem::new("good one", DocumentMeta::named("1")),
            IngestItem::new("bad XX one", DocumentMeta::named("2")),
            IngestItem::new("good two", DocumentMeta::named("3")),
        ];
        let outcomes = store.ingest_batch(items, &CancelToken::new()).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_indexed());
        assert!(matches!(outcomes[1].state, DocumentState::Failed(_)));
        assert!(outcomes[2].is_indexed());
        assert_eq!(
            outcomes.iter().map(|o| o.position).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(store.documents().await.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_batch_commits_nothing_new() {
        let store = KnowledgeStore::new(&config(), poisoned("XX")).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let items = (0..4)
            .map(|i| IngestItem::new(format!("document {}", i), DocumentMeta::named(i.to_string())))
            .collect();
        let outcomes = store.ingest_batch(items, &cancel).await;
        assert!(outcomes.iter().all(|o| o.is_cancelled()));
        assert!(store.documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_reingest_replaces_and_bumps_version() {
        let store = KnowledgeStore::new(&config(), poisoned("XX")).unwrap();
        let meta = DocumentMeta::named("same.txt");
        let id = store.ingest(b"first version text", meta.clone()).await.unwrap();
        let old_chunks = store.chunks(id).await.unwrap();
        let id2 = store.ingest(b"second", meta).await.unwrap();
        assert_eq!(id, id2);

        let doc = store.document(id).await.unwrap();
        assert_eq!(doc.version, 2);
        let new_chunks = store.chunks(id).await.unwrap();
        assert_eq!(new_chunks.len(), 1);
        assert_ne!(new_chunks[0].id, old_chunks[0].id);
        assert_eq!(store.stats().await.vectors, 1);
    }

    #[tokio::test]
    async fn test_failed_reingest_keeps_previous_version() {
        let store = KnowledgeStore::new(&config(), poisoned("XX")).unwrap();
        let meta = DocumentMeta::named("keep.txt");
        let id = store.ingest(b"stable", meta.clone()).await.unwrap();
        assert!(store.ingest(b"broken XX", meta).await.is_err());
        assert_eq!(store.document(id).await.unwrap().version, 1);
        assert_eq!(store.query("stable", 1).await.unwrap()[0].document_id, id);
    }

    #[tokio::test]
    async fn test_empty_document_indexes_with_no_chunks() {
        let store = KnowledgeStore::new(&config(), poisoned("XX")).unwrap();
        let id = store.ingest(b"", DocumentMeta::named("empty")).await.unwrap();
        assert!(store.chunks(id).await.unwrap().is_empty());
        assert_eq!(store.documents().await[0].chunk_count, 0);
    }

    #[tokio::test]
    async fn test_progress_events_follow_stages() {
        let (reporter, mut rx) = ChannelProgress::new();
        let store = KnowledgeStore::new(&config(), poisoned("XX"))
            .unwrap()
            .with_progress(Arc::new(reporter));
        store
            .ingest(b"twenty characters ok", DocumentMeta::named("p"))
            .await
            .unwrap();
        drop(store);

        let mut stages = Vec::new();
        while let Some(event) = rx.recv().await {
            stages.push(event.stage);
        }
        assert_eq!(stages.first(), Some(&Stage::Decoding));
        assert_eq!(stages.last(), Some(&Stage::Indexed));
        assert!(stages.contains(&Stage::Chunking));
        assert_eq!(stages.iter().filter(|s| **s == Stage::Embedding).count(), 3);
    }

    #[tokio::test]
    async fn test_strict_decode_failure() {
        let mut config = config();
        config.encoding.allow_degraded = false;
        config.encoding.candidates = vec![crate::encoding::Candidate::Utf8];
        let store = KnowledgeStore::new(&config, poisoned("XX")).unwrap();
        let err = store
            .ingest(&[0xFF, 0xFE, 0xFD], DocumentMeta::named("bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, KbError::Decode(_)));
    }
}
