//! Implementations of the `kb` subcommands.
//!
//! Each command opens the store from the configured snapshot (or starts
//! empty), does its work, and saves the snapshot again when it changed
//! anything. Results go to stdout; progress and logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::embedding::create_provider;
use crate::files::{collect_files, read_items};
use crate::models::{DocumentId, DocumentState};
use crate::progress::ProgressMode;
use crate::store::{CancelToken, KnowledgeStore};

async fn open_store(config: &Config) -> Result<KnowledgeStore> {
    let provider = create_provider(&config.embedding)?;
    KnowledgeStore::open(config, provider)
        .await
        .with_context(|| format!("Failed to open store at {}", config.store.path.display()))
}

/// `kb ingest <paths…>`
pub async fn run_ingest(config: &Config, paths: &[PathBuf], progress: ProgressMode) -> Result<()> {
    let files = collect_files(paths, &config.ingest)?;
    if files.is_empty() {
        println!("No files matched.");
        return Ok(());
    }

    let read = read_items(&files);
    let (positions, items): (Vec<usize>, Vec<_>) = read.items.into_iter().unzip();

    let store = open_store(config)
        .await?
        .with_progress(Arc::from(progress.reporter()));

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted: finishing in-flight documents...");
            on_interrupt.cancel();
        }
    });

    let mut outcomes = store.ingest_batch(items, &cancel).await;
    interrupt.abort();
    for outcome in &mut outcomes {
        outcome.position = positions[outcome.position];
    }
    outcomes.extend(read.failures);
    outcomes.sort_by_key(|o| o.position);

    let mut indexed = 0;
    for outcome in &outcomes {
        let name = outcome.name.as_deref().unwrap_or("-");
        match &outcome.state {
            DocumentState::Indexed => {
                indexed += 1;
                let degraded = if outcome.degraded { "  (degraded decode)" } else { "" };
                println!(
                    "indexed    {}  {} chunks{}",
                    name, outcome.chunk_count, degraded
                );
            }
            DocumentState::Cancelled => println!("cancelled  {}", name),
            DocumentState::Failed(reason) => println!("failed     {}  {}", name, reason),
            other => println!("{:<10} {}", other.to_string(), name),
        }
    }

    if indexed > 0 {
        store.persist().await?;
    }
    println!(
        "Ingested {} of {} documents into {}",
        indexed,
        outcomes.len(),
        config.store.path.display()
    );

    if indexed < outcomes.len() {
        bail!("{} document(s) were not indexed", outcomes.len() - indexed);
    }
    Ok(())
}

/// `kb query "<text>"`
pub async fn run_query(config: &Config, text: &str, k: usize, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let hits = store.query(text, k).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.3}] {}  (chunk {}, chars {}..{})",
            i + 1,
            hit.score,
            hit.document_name.as_deref().unwrap_or("-"),
            hit.seq,
            hit.start,
            hit.end
        );
        println!("    id: {}", hit.document_id);
        println!("    {}", snippet(&hit.text, 200));
        println!();
    }
    Ok(())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// `kb remove <id>`
pub async fn run_remove(config: &Config, id: &str) -> Result<()> {
    let id: DocumentId = id.parse()?;
    let store = open_store(config).await?;
    store.remove(id).await?;
    store.persist().await?;
    println!("Removed document {}", id);
    Ok(())
}

/// `kb list`
pub async fn run_list(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let documents = store.documents().await;
    if documents.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    for doc in documents {
        println!(
            "{}  v{}  {:<9} {:>4} chunks  {:<8}{}  {}",
            doc.id,
            doc.version,
            doc.state.to_string(),
            doc.chunk_count,
            doc.encoding.to_string(),
            if doc.degraded { " (degraded)" } else { "" },
            doc.name.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// `kb show <id>`
pub async fn run_show(config: &Config, id: &str, preview_chars: usize) -> Result<()> {
    let id: DocumentId = id.parse()?;
    let store = open_store(config).await?;
    let doc = store.document(id).await?;
    let chunks = store.chunks(id).await?;
    let preview = store.preview(id, preview_chars).await?;

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("name:         {}", doc.name.as_deref().unwrap_or("-"));
    println!("version:      {}", doc.version);
    println!(
        "encoding:     {}{}",
        doc.encoding,
        if doc.degraded { " (degraded)" } else { "" }
    );
    println!("bytes:        {}", doc.byte_len);
    println!("chars:        {}", doc.char_len);
    println!("sha256:       {}", doc.content_hash);
    println!("ingested_at:  {}", doc.ingested_at);
    for (key, value) in &doc.attributes {
        println!("{:<13} {}", format!("{}:", key), value);
    }
    println!();

    println!("--- Preview ---");
    println!("{}", preview);
    println!();

    println!("--- Chunks ({}) ---", chunks.len());
    for chunk in &chunks {
        println!("[chunk {}] chars {}..{}", chunk.seq, chunk.start, chunk.end);
    }
    Ok(())
}

/// `kb compact`
pub async fn run_compact(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let reclaimed = store.compact().await;
    store.persist().await?;
    println!("Compacted index: reclaimed {} slots", reclaimed);
    Ok(())
}

/// `kb stats`
pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let stats = store.stats().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("snapshot:    {}", stats.snapshot_path.display());
    println!("documents:   {}", stats.documents);
    println!("  degraded:  {}", stats.degraded_documents);
    println!("chunks:      {}", stats.chunks);
    println!("vectors:     {}", stats.vectors);
    println!("tombstones:  {}", stats.tombstones);
    println!("model:       {} ({} dims)", stats.model, stats.dimension);
    println!("index:       {} / {}", stats.metric, stats.mode);
    Ok(())
}
