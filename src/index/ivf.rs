//! Inverted-file partitioning for approximate search.
//!
//! Centroids come from a few rounds of Lloyd's k-means seeded with evenly
//! spaced live entries (in insertion order), so training is deterministic.
//! Entries inserted after training are filed under their nearest centroid
//! until the next retrain.

use super::{l2_squared, Entry, Metric};

const MAX_ITERATIONS: usize = 10;
const POINTS_PER_LIST: usize = 4;

/// Live entries required before centroids are trained.
pub(super) fn min_training_points(nlist: usize) -> usize {
    nlist * POINTS_PER_LIST
}

#[derive(Debug, Clone)]
pub(super) struct Ivf {
    nlist: usize,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<usize>>,
}

/// Closeness of `v` to `centroid`, higher is closer.
fn affinity(metric: Metric, v: &[f32], centroid: &[f32]) -> f32 {
    match metric {
        Metric::Cosine => metric.score(v, centroid),
        Metric::InnerProduct | Metric::Euclidean => -l2_squared(v, centroid),
    }
}

fn nearest(metric: Metric, centroids: &[Vec<f32>], v: &[f32]) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let s = affinity(metric, v, c);
        if s > best_score {
            best = i;
            best_score = s;
        }
    }
    best
}

impl Ivf {
    pub(super) fn new(nlist: usize) -> Self {
        Self {
            nlist,
            centroids: Vec::new(),
            lists: Vec::new(),
        }
    }

    pub(super) fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    pub(super) fn reset(&mut self) {
        self.centroids.clear();
        self.lists.clear();
    }

    /// List a new vector belongs to, once trained.
    pub(super) fn assign(&self, metric: Metric, v: &[f32]) -> Option<usize> {
        self.is_trained().then(|| nearest(metric, &self.centroids, v))
    }

    pub(super) fn file(&mut self, slot: usize, list: usize) {
        self.lists[list].push(slot);
    }

    pub(super) fn unfile(&mut self, slot: usize, list: usize) {
        self.lists[list].retain(|s| *s != slot);
    }

    pub(super) fn move_slot(&mut self, slot: usize, from: Option<usize>, to: Option<usize>) {
        if let Some(from) = from {
            self.unfile(slot, from);
        }
        if let Some(to) = to {
            self.file(slot, to);
        }
    }

    /// Rebuild the lists from each entry's recorded assignment, after the
    /// slots were renumbered.
    pub(super) fn refile(&mut self, slots: &[Option<Entry>]) {
        for list in &mut self.lists {
            list.clear();
        }
        for (slot, entry) in slots.iter().enumerate() {
            if let Some(list) = entry.as_ref().and_then(|e| e.list) {
                self.lists[list].push(slot);
            }
        }
    }

    /// Train centroids on every live entry and reassign all of them.
    pub(super) fn train(&mut self, metric: Metric, slots: &mut [Option<Entry>]) {
        let live: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter_map(|(slot, e)| e.as_ref().map(|_| slot))
            .collect();
        if live.is_empty() {
            self.reset();
            return;
        }
        let vector = |slot: usize| slots[slot].as_ref().map(|e| e.vector.as_slice()).unwrap_or(&[]);

        let k = self.nlist.min(live.len());
        let mut centroids: Vec<Vec<f32>> = (0..k)
            .map(|c| vector(live[c * live.len() / k]).to_vec())
            .collect();
        let dim = centroids[0].len();
        let mut assignment = vec![usize::MAX; live.len()];

        for _ in 0..MAX_ITERATIONS {
            let mut changed = false;
            for (i, &slot) in live.iter().enumerate() {
                let c = nearest(metric, &centroids, vector(slot));
                if assignment[i] != c {
                    assignment[i] = c;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = vec![vec![0.0f32; dim]; k];
            let mut counts = vec![0usize; k];
            for (i, &slot) in live.iter().enumerate() {
                let c = assignment[i];
                counts[c] += 1;
                for (acc, x) in sums[c].iter_mut().zip(vector(slot)) {
                    *acc += x;
                }
            }
            for c in 0..k {
                // An empty cluster keeps its previous centroid.
                if counts[c] > 0 {
                    let n = counts[c] as f32;
                    centroids[c] = sums[c].iter().map(|s| s / n).collect();
                }
            }
        }

        let final_lists: Vec<usize> = live
            .iter()
            .map(|&slot| nearest(metric, &centroids, vector(slot)))
            .collect();

        self.centroids = centroids;
        self.lists = vec![Vec::new(); k];
        for (&slot, &list) in live.iter().zip(&final_lists) {
            if let Some(entry) = slots[slot].as_mut() {
                entry.list = Some(list);
            }
            self.lists[list].push(slot);
        }
    }

    /// Slots from the `nprobe` closest lists, widened list by list until at
    /// least `k` candidates are collected.
    pub(super) fn candidates(
        &self,
        metric: Metric,
        query: &[f32],
        nprobe: usize,
        k: usize,
        slots: &[Option<Entry>],
    ) -> Vec<usize> {
        let mut order: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, affinity(metric, query, c)))
            .collect();
        order.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut out = Vec::new();
        for (probed, (list, _)) in order.into_iter().enumerate() {
            if probed >= nprobe && out.len() >= k {
                break;
            }
            out.extend(self.lists[list].iter().copied().filter(|&s| slots[s].is_some()));
        }
        out
    }
}
