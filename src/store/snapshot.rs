//! Single-file snapshot container.
//!
//! ```text
//! magic "KBSNAP" | version u16 | meta_len u64 | meta JSON
//!                | index_len u64 | index bytes | SHA-256 of all preceding bytes
//! ```
//!
//! All integers are little-endian. Files are written to a temporary sibling,
//! fsynced and renamed over the target, so a crash leaves either the old or
//! the new snapshot in place.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{KbError, Result};
use crate::index::{IndexMode, Metric};
use crate::models::{Chunk, Document};

pub const MAGIC: &[u8; 6] = b"KBSNAP";
pub const CONTAINER_VERSION: u16 = 1;
const CHECKSUM_LEN: usize = 32;

/// A document and its chunks as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document: Document,
    pub chunks: Vec<Chunk>,
}

/// Metadata half of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Crate version that wrote the snapshot.
    pub writer: String,
    pub model: String,
    pub dims: usize,
    pub metric: Metric,
    pub mode: IndexMode,
    pub saved_at: chrono::DateTime<chrono::Utc>,
    pub documents: Vec<DocumentRecord>,
}

fn corrupt(msg: impl Into<String>) -> KbError {
    KbError::CorruptState(msg.into())
}

pub fn encode(meta: &SnapshotMeta, index_bytes: &[u8]) -> Result<Vec<u8>> {
    let meta_json = serde_json::to_vec(meta)
        .map_err(|e| corrupt(format!("failed to serialize metadata: {}", e)))?;

    let mut out =
        Vec::with_capacity(MAGIC.len() + 2 + 16 + meta_json.len() + index_bytes.len() + CHECKSUM_LEN);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
    out.extend_from_slice(&(meta_json.len() as u64).to_le_bytes());
    out.extend_from_slice(&meta_json);
    out.extend_from_slice(&(index_bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(index_bytes);
    let digest = Sha256::digest(&out);
    out.extend_from_slice(&digest);
    Ok(out)
}

fn read_u64(bytes: &[u8], pos: usize) -> Result<u64> {
    bytes
        .get(pos..pos + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| corrupt("snapshot truncated"))
}

/// Validate the container and split it into metadata and index bytes.
pub fn decode(bytes: &[u8]) -> Result<(SnapshotMeta, &[u8])> {
    let header = MAGIC.len() + 2;
    if bytes.len() < header + CHECKSUM_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(corrupt("not a knowledge base snapshot (bad magic)"));
    }
    let version = u16::from_le_bytes([bytes[6], bytes[7]]);
    if version != CONTAINER_VERSION {
        return Err(corrupt(format!(
            "unsupported snapshot version {} (expected {})",
            version, CONTAINER_VERSION
        )));
    }

    let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if Sha256::digest(body).as_slice() != checksum {
        return Err(corrupt("snapshot checksum mismatch"));
    }

    let meta_len = read_u64(body, header)? as usize;
    let meta_start = header + 8;
    let meta_end = meta_start
        .checked_add(meta_len)
        .filter(|end| *end <= body.len())
        .ok_or_else(|| corrupt("snapshot truncated"))?;
    let meta: SnapshotMeta = serde_json::from_slice(&body[meta_start..meta_end])
        .map_err(|e| corrupt(format!("invalid snapshot metadata: {}", e)))?;

    let index_len = read_u64(body, meta_end)? as usize;
    let index_start = meta_end + 8;
    if index_start.checked_add(index_len) != Some(body.len()) {
        return Err(corrupt("snapshot index length disagrees with file size"));
    }
    Ok((meta, &body[index_start..]))
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()))
}

/// Write `bytes` to `path` atomically.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
        return result;
    }

    #[cfg(unix)]
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
    Ok(())
}
