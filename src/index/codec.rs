//! Versioned little-endian binary layout for [`VectorIndex`].
//!
//! ```text
//! offset  size  field
//! 0       4     magic "KBVI"
//! 4       2     format version (u16)
//! 6       1     metric (0 cosine, 1 inner product, 2 euclidean)
//! 7       1     mode (0 exact, 1 approximate)
//! 8       4     dimension (u32, 0 while unset)
//! 12      8     entry count (u64)
//! 20      ...   entries: 16-byte chunk id + dimension × f32
//! ```
//!
//! Entries are written in insertion order, tombstones skipped. Inverted
//! lists are not stored; an approximate index retrains on decode.

use super::{IndexConfig, IndexMode, Metric, VectorIndex};
use crate::error::{KbError, Result};
use crate::models::ChunkId;

pub const MAGIC: &[u8; 4] = b"KBVI";
pub const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 20;

pub(super) fn encode(index: &VectorIndex) -> Vec<u8> {
    let dim = index.dimension().unwrap_or(0);
    let mut out = Vec::with_capacity(HEADER_LEN + index.len() * (16 + dim * 4));
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.push(index.metric().code());
    out.push(index.mode().code());
    out.extend_from_slice(&(dim as u32).to_le_bytes());
    out.extend_from_slice(&(index.len() as u64).to_le_bytes());
    for (id, vector) in index.iter() {
        out.extend_from_slice(id.as_bytes());
        for value in vector {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    out
}

fn corrupt(msg: impl Into<String>) -> KbError {
    KbError::CorruptState(format!("vector index: {}", msg.into()))
}

/// Cursor over the encoded bytes.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| corrupt("truncated"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }
}

pub(super) fn decode(bytes: &[u8], config: IndexConfig) -> Result<VectorIndex> {
    let mut r = Reader { bytes, pos: 0 };

    if &r.array::<4>()? != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = u16::from_le_bytes(r.array()?);
    if version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported format version {}", version)));
    }
    let [metric, mode] = r.array::<2>()?;
    let metric = Metric::from_code(metric).ok_or_else(|| corrupt("unknown metric"))?;
    let mode = IndexMode::from_code(mode).ok_or_else(|| corrupt("unknown mode"))?;
    let dim = u32::from_le_bytes(r.array()?) as usize;
    let count = u64::from_le_bytes(r.array()?);

    let entry_len = 16 + dim * 4;
    let remaining = (bytes.len() - HEADER_LEN) as u64;
    if count.checked_mul(entry_len as u64) != Some(remaining) {
        return Err(corrupt(format!(
            "{} entries of dimension {} do not fit {} bytes",
            count, dim, remaining
        )));
    }
    if dim == 0 && count > 0 {
        return Err(corrupt("entries without a dimension"));
    }

    let mut index = VectorIndex::new(IndexConfig {
        metric,
        mode,
        dimension: (dim > 0).then_some(dim).or(config.dimension),
        ..config
    })?;

    for _ in 0..count {
        let id = ChunkId::from_bytes(r.array()?);
        let vector = r
            .take(dim * 4)?
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if index.contains(&id) {
            return Err(corrupt(format!("duplicate chunk id {}", id)));
        }
        index.insert(id, vector)?;
    }
    if index.mode() == IndexMode::Approximate {
        index.rebuild();
    }
    Ok(index)
}
