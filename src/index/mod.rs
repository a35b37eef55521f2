//! In-memory vector index keyed by chunk id.
//!
//! Two search modes share one interface:
//!
//! - **Exact** (default): flat scan over every live entry.
//! - **Approximate**: inverted-file partitioning. Entries are assigned to
//!   the nearest of `nlist` k-means centroids; a search probes the `nprobe`
//!   closest lists and widens until at least `k` candidates are found, then
//!   ranks those candidates exactly.
//!
//! Entries live in insertion-ordered slots. Removal leaves a tombstone so
//! that ranking ties stay broken by insertion order (earlier wins);
//! [`VectorIndex::compact`] drops the tombstones without reordering.
//!
//! The binary layout used by [`VectorIndex::to_bytes`] is described in
//! [`codec`].

pub mod codec;
mod ivf;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{KbError, Result};
use crate::models::ChunkId;

use ivf::Ivf;

/// Similarity metric, fixed for the lifetime of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Cosine,
    InnerProduct,
    /// Scored as `1 / (1 + L2 distance)`.
    Euclidean,
}

impl Metric {
    pub(crate) fn code(self) -> u8 {
        match self {
            Metric::Cosine => 0,
            Metric::InnerProduct => 1,
            Metric::Euclidean => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Metric::Cosine),
            1 => Some(Metric::InnerProduct),
            2 => Some(Metric::Euclidean),
            _ => None,
        }
    }

    /// Higher is more similar for every metric.
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => {
                let dot = dot(a, b);
                let norms = norm(a) * norm(b);
                if norms <= f32::EPSILON {
                    0.0
                } else {
                    dot / norms
                }
            }
            Metric::InnerProduct => dot(a, b),
            Metric::Euclidean => 1.0 / (1.0 + l2_squared(a, b).sqrt()),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Cosine => write!(f, "cosine"),
            Metric::InnerProduct => write!(f, "inner_product"),
            Metric::Euclidean => write!(f, "euclidean"),
        }
    }
}

/// Search strategy, fixed for the lifetime of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    #[default]
    Exact,
    Approximate,
}

impl IndexMode {
    pub(crate) fn code(self) -> u8 {
        match self {
            IndexMode::Exact => 0,
            IndexMode::Approximate => 1,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(IndexMode::Exact),
            1 => Some(IndexMode::Approximate),
            _ => None,
        }
    }
}

impl fmt::Display for IndexMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexMode::Exact => write!(f, "exact"),
            IndexMode::Approximate => write!(f, "approximate"),
        }
    }
}

/// Construction parameters for a [`VectorIndex`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexConfig {
    pub metric: Metric,
    pub mode: IndexMode,
    /// Fixes the dimension up front; otherwise the first insert does.
    pub dimension: Option<usize>,
    /// Removing an absent id fails with `NotFound` instead of returning `false`.
    pub strict_remove: bool,
    /// Number of inverted lists (approximate mode).
    pub nlist: usize,
    /// Lists probed per search before widening (approximate mode).
    pub nprobe: usize,
    /// Fraction of removed entries since the last rebuild above which
    /// [`VectorIndex::needs_rebuild`] reports true.
    pub rebuild_threshold: f32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Cosine,
            mode: IndexMode::Exact,
            dimension: None,
            strict_remove: false,
            nlist: 16,
            nprobe: 4,
            rebuild_threshold: 0.3,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dimension == Some(0) {
            return Err(KbError::Config("index dimension must be > 0".to_string()));
        }
        if self.nlist == 0 {
            return Err(KbError::Config("index.nlist must be > 0".to_string()));
        }
        if self.nprobe == 0 || self.nprobe > self.nlist {
            return Err(KbError::Config(format!(
                "index.nprobe must be between 1 and nlist ({})",
                self.nlist
            )));
        }
        if !(self.rebuild_threshold > 0.0 && self.rebuild_threshold <= 1.0) {
            return Err(KbError::Config(
                "index.rebuild_threshold must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    id: ChunkId,
    vector: Vec<f32>,
    /// Inverted list this entry is filed under (approximate mode, trained).
    list: Option<usize>,
}

/// Vector index with stable insertion-order tie breaking.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    config: IndexConfig,
    dimension: Option<usize>,
    slots: Vec<Option<Entry>>,
    positions: HashMap<ChunkId, usize>,
    removed_since_rebuild: usize,
    ivf: Option<Ivf>,
}

impl VectorIndex {
    pub fn new(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let ivf = match config.mode {
            IndexMode::Exact => None,
            IndexMode::Approximate => Some(Ivf::new(config.nlist)),
        };
        Ok(Self {
            dimension: config.dimension,
            config,
            slots: Vec::new(),
            positions: HashMap::new(),
            removed_since_rebuild: 0,
            ivf,
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn metric(&self) -> Metric {
        self.config.metric
    }

    pub fn mode(&self) -> IndexMode {
        self.config.mode
    }

    /// The fixed dimension, once known.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.positions.contains_key(id)
    }

    /// Removed slots not yet reclaimed by [`compact`](Self::compact).
    pub fn tombstones(&self) -> usize {
        self.slots.len() - self.positions.len()
    }

    /// Vector stored under `id`.
    pub fn get(&self, id: &ChunkId) -> Option<&[f32]> {
        let slot = *self.positions.get(id)?;
        self.slots[slot].as_ref().map(|e| e.vector.as_slice())
    }

    /// Live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ChunkId, &[f32])> + '_ {
        self.slots
            .iter()
            .flatten()
            .map(|e| (e.id, e.vector.as_slice()))
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        match self.dimension {
            Some(expected) if expected != actual => {
                Err(KbError::DimensionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }

    /// Add `vector` under `id`, replacing any existing entry.
    ///
    /// A replaced entry keeps its original insertion position.
    pub fn insert(&mut self, id: ChunkId, vector: Vec<f32>) -> Result<()> {
        if vector.is_empty() {
            return Err(KbError::DimensionMismatch {
                expected: self.dimension.unwrap_or(0),
                actual: 0,
            });
        }
        self.check_dimension(vector.len())?;
        if self.dimension.is_none() {
            self.dimension = Some(vector.len());
        }

        let list = self
            .ivf
            .as_ref()
            .and_then(|ivf| ivf.assign(self.config.metric, &vector));

        match self.positions.get(&id) {
            Some(&slot) => {
                let previous = self.slots[slot].as_ref().and_then(|e| e.list);
                if let Some(ivf) = self.ivf.as_mut() {
                    ivf.move_slot(slot, previous, list);
                }
                self.slots[slot] = Some(Entry { id, vector, list });
            }
            None => {
                let slot = self.slots.len();
                if let (Some(ivf), Some(list)) = (self.ivf.as_mut(), list) {
                    ivf.file(slot, list);
                }
                self.slots.push(Some(Entry { id, vector, list }));
                self.positions.insert(id, slot);
            }
        }

        if self.ivf.as_ref().is_some_and(|ivf| !ivf.is_trained())
            && self.len() >= ivf::min_training_points(self.config.nlist)
        {
            self.train();
        }
        Ok(())
    }

    /// Delete `id`. Returns whether an entry was removed.
    ///
    /// # Errors
    ///
    /// `NotFound` for an absent id when `strict_remove` is configured.
    pub fn remove(&mut self, id: &ChunkId) -> Result<bool> {
        match self.positions.remove(id) {
            Some(slot) => {
                if let Some(entry) = self.slots[slot].take() {
                    if let (Some(ivf), Some(list)) = (self.ivf.as_mut(), entry.list) {
                        ivf.unfile(slot, list);
                    }
                }
                self.removed_since_rebuild += 1;
                Ok(true)
            }
            None if self.config.strict_remove => {
                Err(KbError::NotFound(format!("chunk {} not in index", id)))
            }
            None => Ok(false),
        }
    }

    /// Up to `k` `(id, score)` pairs by descending score.
    ///
    /// Fewer than `k` are returned only when the index holds fewer than `k`
    /// entries.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(ChunkId, f32)>> {
        match self.dimension {
            Some(_) => self.check_dimension(query.len())?,
            None => return Ok(Vec::new()),
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let metric = self.config.metric;
        let mut scored: Vec<(usize, f32)> = match self.ivf.as_ref().filter(|i| i.is_trained()) {
            Some(ivf) => ivf
                .candidates(metric, query, self.config.nprobe, k, &self.slots)
                .into_iter()
                .filter_map(|slot| {
                    self.slots[slot]
                        .as_ref()
                        .map(|e| (slot, metric.score(query, &e.vector)))
                })
                .collect(),
            None => self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(slot, e)| e.as_ref().map(|e| (slot, metric.score(query, &e.vector))))
                .collect(),
        };

        scored.sort_by(|a, b| rank(*a, *b));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .filter_map(|(slot, score)| self.slots[slot].as_ref().map(|e| (e.id, score)))
            .collect())
    }

    /// Drop tombstoned slots, preserving insertion order.
    pub fn compact(&mut self) {
        if self.tombstones() == 0 {
            return;
        }
        let before = self.slots.len();
        self.slots.retain(Option::is_some);
        self.positions = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, e)| e.as_ref().map(|e| (e.id, slot)))
            .collect();
        if let Some(ivf) = self.ivf.as_mut() {
            ivf.refile(&self.slots);
        }
        debug!(reclaimed = before - self.slots.len(), "compacted vector index");
    }

    /// Whether deletion churn since the last rebuild exceeds the threshold.
    pub fn needs_rebuild(&self) -> bool {
        if self.removed_since_rebuild == 0 {
            return false;
        }
        let base = (self.len() + self.removed_since_rebuild) as f32;
        self.removed_since_rebuild as f32 / base > self.config.rebuild_threshold
    }

    /// Compact and, in approximate mode, retrain the partitioning.
    pub fn rebuild(&mut self) {
        self.compact();
        if self.ivf.is_some() {
            self.train();
        }
        self.removed_since_rebuild = 0;
    }

    fn train(&mut self) {
        let Some(ivf) = self.ivf.as_mut() else {
            return;
        };
        if self.positions.len() < ivf::min_training_points(self.config.nlist) {
            ivf.reset();
            for entry in self.slots.iter_mut().flatten() {
                entry.list = None;
            }
            return;
        }
        ivf.train(self.config.metric, &mut self.slots);
        debug!(
            nlist = self.config.nlist,
            entries = self.positions.len(),
            "trained inverted lists"
        );
    }

    /// Serialize with the layout described in [`codec`].
    pub fn to_bytes(&self) -> Vec<u8> {
        codec::encode(self)
    }

    /// Deserialize an index written by [`to_bytes`](Self::to_bytes).
    ///
    /// The stored metric, mode and dimension take precedence over `config`;
    /// the remaining tuning parameters come from `config`.
    pub fn from_bytes(bytes: &[u8], config: IndexConfig) -> Result<Self> {
        codec::decode(bytes, config)
    }
}

/// Descending score, then ascending slot.
fn rank(a: (usize, f32), b: (usize, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

pub(crate) fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentId;

    fn id(n: usize) -> ChunkId {
        ChunkId::derive(DocumentId::from_name("index-tests"), 1, n)
    }

    fn index(metric: Metric) -> VectorIndex {
        VectorIndex::new(IndexConfig {
            metric,
            ..IndexConfig::default()
        })
        .unwrap()
    }

    /// Small deterministic pseudo-random vectors.
    pub(crate) fn vectors(n: usize, dim: usize) -> Vec<Vec<f32>> {
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        (0..n)
            .map(|_| {
                (0..dim)
                    .map(|_| {
                        state ^= state << 13;
                        state ^= state >> 7;
                        state ^= state << 17;
                        (state % 2000) as f32 / 1000.0 - 1.0
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_self_match_all_metrics() {
        for metric in [Metric::Cosine, Metric::InnerProduct, Metric::Euclidean] {
            let mut idx = index(metric);
            let data = vectors(50, 8);
            for (i, v) in data.iter().enumerate() {
                idx.insert(id(i), v.clone()).unwrap();
            }
            for (i, v) in data.iter().enumerate() {
                let hits = idx.search(v, 1).unwrap();
                if metric == Metric::InnerProduct {
                    // A larger vector in the same direction can outrank self.
                    let best = idx.search(v, 50).unwrap();
                    assert!(best.iter().any(|(h, _)| *h == id(i)));
                } else {
                    assert_eq!(hits[0].0, id(i), "metric {}", metric);
                }
            }
        }
    }

    #[test]
    fn test_euclidean_score_formula() {
        let mut idx = index(Metric::Euclidean);
        idx.insert(id(0), vec![0.0, 0.0]).unwrap();
        let hits = idx.search(&[3.0, 4.0], 1).unwrap();
        assert!((hits[0].1 - 1.0 / 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_first_insert_fixes_dimension() {
        let mut idx = index(Metric::Cosine);
        idx.insert(id(0), vec![1.0, 0.0, 0.0]).unwrap();
        let err = idx.insert(id(1), vec![1.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            KbError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert!(matches!(
            idx.search(&[1.0], 1),
            Err(KbError::DimensionMismatch { .. })
        ));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_constructor_dimension() {
        let mut idx = VectorIndex::new(IndexConfig {
            dimension: Some(4),
            ..IndexConfig::default()
        })
        .unwrap();
        assert!(idx.insert(id(0), vec![1.0; 3]).is_err());
        assert!(idx.insert(id(0), vec![1.0; 4]).is_ok());
    }

    #[test]
    fn test_removed_ids_never_returned() {
        let mut idx = index(Metric::Cosine);
        let data = vectors(20, 4);
        for (i, v) in data.iter().enumerate() {
            idx.insert(id(i), v.clone()).unwrap();
        }
        assert!(idx.remove(&id(3)).unwrap());
        assert!(!idx.remove(&id(3)).unwrap());
        let hits = idx.search(&data[3], 20).unwrap();
        assert_eq!(hits.len(), 19);
        assert!(hits.iter().all(|(h, _)| *h != id(3)));
    }

    #[test]
    fn test_strict_remove() {
        let mut idx = VectorIndex::new(IndexConfig {
            strict_remove: true,
            ..IndexConfig::default()
        })
        .unwrap();
        assert!(matches!(idx.remove(&id(1)), Err(KbError::NotFound(_))));
    }

    #[test]
    fn test_ties_broken_by_insertion_order() {
        let mut idx = index(Metric::Cosine);
        for i in 0..5 {
            idx.insert(id(i), vec![1.0, 1.0]).unwrap();
        }
        let hits = idx.search(&[1.0, 1.0], 3).unwrap();
        let ids: Vec<ChunkId> = hits.into_iter().map(|(h, _)| h).collect();
        assert_eq!(ids, vec![id(0), id(1), id(2)]);
    }

    #[test]
    fn test_replacement_keeps_position() {
        let mut idx = index(Metric::Cosine);
        idx.insert(id(0), vec![0.0, 1.0]).unwrap();
        idx.insert(id(1), vec![1.0, 0.0]).unwrap();
        idx.insert(id(0), vec![1.0, 0.0]).unwrap();
        assert_eq!(idx.len(), 2);
        let hits = idx.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].0, id(0));
        assert_eq!(hits[1].0, id(1));
    }

    #[test]
    fn test_search_fewer_than_k() {
        let mut idx = index(Metric::Cosine);
        assert!(idx.search(&[1.0], 5).unwrap().is_empty());
        idx.insert(id(0), vec![1.0, 0.0]).unwrap();
        assert_eq!(idx.search(&[1.0, 0.0], 5).unwrap().len(), 1);
        assert!(idx.search(&[1.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_compact_preserves_order_and_results() {
        let mut idx = index(Metric::Cosine);
        for i in 0..6 {
            idx.insert(id(i), vec![1.0, 1.0]).unwrap();
        }
        idx.remove(&id(0)).unwrap();
        idx.remove(&id(2)).unwrap();
        assert_eq!(idx.tombstones(), 2);
        let before = idx.search(&[1.0, 1.0], 4).unwrap();
        idx.compact();
        assert_eq!(idx.tombstones(), 0);
        assert_eq!(idx.search(&[1.0, 1.0], 4).unwrap(), before);
        assert_eq!(before[0].0, id(1));
    }

    #[test]
    fn test_needs_rebuild_after_churn() {
        let mut idx = index(Metric::Cosine);
        for i in 0..10 {
            idx.insert(id(i), vec![i as f32, 1.0]).unwrap();
        }
        idx.remove(&id(0)).unwrap();
        idx.remove(&id(1)).unwrap();
        assert!(!idx.needs_rebuild());
        idx.remove(&id(2)).unwrap();
        idx.remove(&id(3)).unwrap();
        assert!(idx.needs_rebuild());
        idx.rebuild();
        assert!(!idx.needs_rebuild());
        assert_eq!(idx.tombstones(), 0);
        assert_eq!(idx.len(), 6);
    }

    #[test]
    fn test_config_validation() {
        for config in [
            IndexConfig {
                nlist: 0,
                ..IndexConfig::default()
            },
            IndexConfig {
                nprobe: 17,
                ..IndexConfig::default()
            },
            IndexConfig {
                rebuild_threshold: 0.0,
                ..IndexConfig::default()
            },
            IndexConfig {
                dimension: Some(0),
                ..IndexConfig::default()
            },
        ] {
            assert!(matches!(VectorIndex::new(config), Err(KbError::Config(_))));
        }
    }

    #[test]
    fn test_approximate_returns_k_and_self_matches() {
        let mut idx = VectorIndex::new(IndexConfig {
            mode: IndexMode::Approximate,
            nlist: 4,
            nprobe: 1,
            ..IndexConfig::default()
        })
        .unwrap();
        let data = vectors(200, 6);
        for (i, v) in data.iter().enumerate() {
            idx.insert(id(i), v.clone()).unwrap();
        }
        for (i, v) in data.iter().enumerate().step_by(17) {
            let hits = idx.search(v, 1).unwrap();
            assert_eq!(hits[0].0, id(i));
        }
        assert_eq!(idx.search(&data[0], 150).unwrap().len(), 150);
    }

    #[test]
    fn test_approximate_remove_and_rebuild() {
        let mut idx = VectorIndex::new(IndexConfig {
            mode: IndexMode::Approximate,
            nlist: 4,
            nprobe: 2,
            ..IndexConfig::default()
        })
        .unwrap();
        let data = vectors(100, 4);
        for (i, v) in data.iter().enumerate() {
            idx.insert(id(i), v.clone()).unwrap();
        }
        for i in 0..50 {
            idx.remove(&id(i)).unwrap();
        }
        assert!(idx.needs_rebuild());
        idx.rebuild();
        let hits = idx.search(&data[10], 100).unwrap();
        assert_eq!(hits.len(), 50);
        assert!(hits.iter().all(|(h, _)| !(0..50).any(|i| *h == id(i))));
        assert_eq!(idx.search(&data[70], 1).unwrap()[0].0, id(70));
    }
}
