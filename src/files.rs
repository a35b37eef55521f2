//! Collect ingest inputs from files and directories.
//!
//! Paths named explicitly are always taken. Directories are walked
//! recursively and filtered by the `[ingest]` include/exclude globs, matched
//! against the path relative to the directory. Version-control and build
//! directories are always excluded. Files are read as raw bytes; decoding
//! happens in the pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::error::{KbError, Result};
use crate::models::{DocumentMeta, DocumentOutcome, DocumentState};
use crate::store::IngestItem;

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Resolve `paths` into the list of files to ingest, sorted and deduplicated.
pub fn collect_files(paths: &[PathBuf], config: &IngestConfig) -> Result<Vec<PathBuf>> {
    let include_set = build_globset(&config.include_globs)?;
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for root in paths {
        if root.is_file() {
            files.push(root.clone());
            continue;
        }
        if !root.is_dir() {
            return Err(KbError::NotFound(format!(
                "input path does not exist: {}",
                root.display()
            )));
        }

        for entry in WalkDir::new(root) {
            let entry = entry.map_err(|e| {
                KbError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy();
            if exclude_set.is_match(rel_str.as_ref()) || !include_set.is_match(rel_str.as_ref()) {
                continue;
            }
            files.push(path.to_path_buf());
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

/// Read a file into an [`IngestItem`] named after its path.
pub fn read_item(path: &Path) -> Result<IngestItem> {
    let bytes = std::fs::read(path)?;
    let mut attributes = BTreeMap::new();
    attributes.insert("path".to_string(), path.display().to_string());
    if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
        let modified: DateTime<Utc> = modified.into();
        attributes.insert("modified".to_string(), modified.to_rfc3339());
    }

    let meta = DocumentMeta {
        name: Some(path.display().to_string()),
        id: None,
        attributes,
    };
    Ok(IngestItem::new(bytes, meta))
}

/// Files read for a batch, split into readable items and per-file failures.
///
/// Each readable item keeps its position in `paths`; failures are already
/// `Failed` outcomes at their position.
#[derive(Debug, Default)]
pub struct ReadItems {
    pub items: Vec<(usize, IngestItem)>,
    pub failures: Vec<DocumentOutcome>,
}

/// Read every path, turning unreadable files into failed outcomes instead
/// of aborting the batch.
pub fn read_items(paths: &[PathBuf]) -> ReadItems {
    let mut read = ReadItems::default();
    for (position, path) in paths.iter().enumerate() {
        match read_item(path) {
            Ok(item) => read.items.push((position, item)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read input file");
                let name = path.display().to_string();
                read.failures.push(DocumentOutcome {
                    position,
                    document_id: DocumentMeta::named(name.clone()).document_id(),
                    name: Some(name),
                    state: DocumentState::Failed(format!("read failed: {}", e)),
                    chunk_count: 0,
                    degraded: false,
                });
            }
        }
    }
    read
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| KbError::Config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| KbError::Config(format!("invalid glob set: {}", e)))
}
