//! HNSW-backed vector store for one vector field.
//!
//! Uses rust-cv/hnsw, which supports incremental insertion. HNSW has no
//! true deletion, so removed entries are tombstoned and filtered out of
//! results; [`VectorStore::repair`] rebuilds the graph to reclaim space.

use crate::error::{Error, Result};
use crate::schema::VectorDistanceMetric;
use crate::SeqId;
use hnsw::{Hnsw, Searcher};
use space::{Metric, Neighbor};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Minimum ef parameter for HNSW queries; scales with k but never drops
/// below this recall floor.
const MIN_EF_SEARCH: usize = 50;

/// Distance metric over owned embedding slices, scaled to u32 for HNSW.
///
/// The scaled value only drives graph traversal; reported distances are
/// recomputed exactly from the stored vectors.
#[derive(Debug, Clone, Copy)]
struct ScaledDistance {
    metric: VectorDistanceMetric,
}

impl ScaledDistance {
    fn exact(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.metric {
            VectorDistanceMetric::Cosine => {
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let mag_b: f32 = b.iter().map(|y| y * y).sum::<f32>().sqrt();
                if mag_a == 0.0 || mag_b == 0.0 {
                    return 2.0;
                }
                1.0 - dot / (mag_a * mag_b)
            }
            VectorDistanceMetric::Ip => {
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                -dot
            }
            VectorDistanceMetric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }
}

impl Metric<Box<[f32]>> for ScaledDistance {
    type Unit = u32;

    fn distance(&self, a: &Box<[f32]>, b: &Box<[f32]>) -> u32 {
        let d = self.exact(a, b);
        // Shift inner-product scores into the positive range before scaling.
        let normalized = match self.metric {
            VectorDistanceMetric::Cosine => d / 2.0,
            VectorDistanceMetric::Ip => (d / 1_000.0 + 1.0).clamp(0.0, 2.0) / 2.0,
            VectorDistanceMetric::L2 => (d / 1_000.0).clamp(0.0, 1.0),
        };
        (normalized * (u32::MAX as f32)) as u32
    }
}

/// Vector store for a single `float[]` field with `num_dim` set.
pub struct VectorStore {
    index: Hnsw<ScaledDistance, Box<[f32]>, rand::rngs::StdRng, 16, 32>,
    /// HNSW position -> seq id.
    seq_ids: Vec<SeqId>,
    vectors: HashMap<SeqId, Vec<f32>>,
    tombstones: HashSet<usize>,
    num_dim: usize,
    metric: VectorDistanceMetric,
}

impl VectorStore {
    pub fn new(num_dim: usize, metric: VectorDistanceMetric) -> Self {
        Self {
            index: Hnsw::new(ScaledDistance { metric }),
            seq_ids: Vec::new(),
            vectors: HashMap::new(),
            tombstones: HashSet::new(),
            num_dim,
            metric,
        }
    }

    pub fn num_dim(&self) -> usize {
        self.num_dim
    }

    pub fn len(&self) -> usize {
        self.seq_ids.len() - self.tombstones.len()
    }

    pub fn contains(&self, seq_id: SeqId) -> bool {
        self.vectors.contains_key(&seq_id)
    }

    pub fn get(&self, seq_id: SeqId) -> Option<&Vec<f32>> {
        self.vectors.get(&seq_id)
    }

    /// Inserts an embedding. Re-inserting a seq id tombstones its previous
    /// position first.
    pub fn add(&mut self, seq_id: SeqId, embedding: Vec<f32>) -> Result<()> {
        if embedding.len() != self.num_dim {
            return Err(Error::invalid(format!(
                "Embedding dimension mismatch: expected {}, got {}.",
                self.num_dim,
                embedding.len()
            )));
        }
        if self.vectors.contains_key(&seq_id) {
            self.remove(seq_id);
        }
        let mut searcher = Searcher::default();
        self.index
            .insert(embedding.clone().into_boxed_slice(), &mut searcher);
        self.seq_ids.push(seq_id);
        self.vectors.insert(seq_id, embedding);
        Ok(())
    }

    /// Tombstones every position held by `seq_id`.
    pub fn remove(&mut self, seq_id: SeqId) {
        for (pos, id) in self.seq_ids.iter().enumerate() {
            if *id == seq_id {
                self.tombstones.insert(pos);
            }
        }
        self.vectors.remove(&seq_id);
    }

    /// k-NN search. Returns `(seq_id, exact_distance)` pairs ascending by
    /// distance, tombstones excluded.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(SeqId, f32)>> {
        if query.len() != self.num_dim {
            return Err(Error::invalid(format!(
                "Query vector dimension mismatch: expected {}, got {}.",
                self.num_dim,
                query.len()
            )));
        }
        if self.seq_ids.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        // Over-fetch to survive tombstone filtering.
        let want = (k + self.tombstones.len()).min(self.seq_ids.len());
        let ef = (want * 2).max(MIN_EF_SEARCH);
        let mut searcher = Searcher::default();
        let mut neighbors = vec![
            Neighbor {
                index: 0,
                distance: u32::MAX,
            };
            want
        ];
        let query_box: Box<[f32]> = query.to_vec().into_boxed_slice();
        let found = self
            .index
            .nearest(&query_box, ef, &mut searcher, &mut neighbors);

        let scaled = ScaledDistance {
            metric: self.metric,
        };
        let mut results: Vec<(SeqId, f32)> = Vec::with_capacity(found.len());
        for neighbor in found.iter() {
            if self.tombstones.contains(&neighbor.index) {
                continue;
            }
            let seq_id = self.seq_ids[neighbor.index];
            if let Some(vector) = self.vectors.get(&seq_id) {
                results.push((seq_id, scaled.exact(query, vector)));
            }
        }
        results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        Ok(results)
    }

    /// Rebuilds the HNSW graph without tombstoned entries.
    pub fn repair(&mut self) {
        if self.tombstones.is_empty() {
            return;
        }
        let live: Vec<(SeqId, Vec<f32>)> = self
            .seq_ids
            .iter()
            .enumerate()
            .filter(|(pos, _)| !self.tombstones.contains(pos))
            .map(|(_, id)| (*id, self.vectors[id].clone()))
            .collect();

        debug!(
            live = live.len(),
            tombstones = self.tombstones.len(),
            "Rebuilding HNSW graph"
        );

        self.index = Hnsw::new(ScaledDistance {
            metric: self.metric,
        });
        self.seq_ids.clear();
        self.tombstones.clear();
        self.vectors.clear();
        let mut searcher = Searcher::default();
        for (seq_id, vector) in live {
            self.index
                .insert(vector.clone().into_boxed_slice(), &mut searcher);
            self.seq_ids.push(seq_id);
            self.vectors.insert(seq_id, vector);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_nearest_neighbor_cosine() {
        let mut store = VectorStore::new(3, VectorDistanceMetric::Cosine);
        store.add(1, unit(3, 0)).unwrap();
        store.add(2, unit(3, 1)).unwrap();
        store.add(3, vec![0.9, 0.1, 0.0]).unwrap();

        let results = store.search(&unit(3, 0), 2).unwrap();
        assert_eq!(results[0].0, 1);
        assert!(results[0].1 < 1e-6);
        assert_eq!(results[1].0, 3);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut store = VectorStore::new(3, VectorDistanceMetric::Cosine);
        assert!(store.add(1, vec![1.0, 0.0]).is_err());
        store.add(1, unit(3, 0)).unwrap();
        assert!(store.search(&[1.0, 0.0], 1).is_err());
    }

    #[test]
    fn test_tombstoned_entry_excluded() {
        let mut store = VectorStore::new(2, VectorDistanceMetric::Cosine);
        store.add(1, vec![1.0, 0.0]).unwrap();
        store.add(2, vec![0.0, 1.0]).unwrap();

        store.remove(1);
        let results = store.search(&[1.0, 0.0], 2).unwrap();
        assert!(results.iter().all(|(id, _)| *id != 1));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_repair_rebuilds_without_tombstones() {
        let mut store = VectorStore::new(2, VectorDistanceMetric::Cosine);
        for i in 0..10u32 {
            store
                .add(i, vec![(i as f32).cos(), (i as f32).sin()])
                .unwrap();
        }
        for i in 0..5u32 {
            store.remove(i);
        }
        store.repair();
        assert_eq!(store.len(), 5);
        let results = store.search(&[5.0f32.cos(), 5.0f32.sin()], 3).unwrap();
        assert_eq!(results[0].0, 5);
    }

    #[test]
    fn test_l2_distance_reported_exactly() {
        let mut store = VectorStore::new(2, VectorDistanceMetric::L2);
        store.add(1, vec![0.0, 0.0]).unwrap();
        store.add(2, vec![3.0, 4.0]).unwrap();
        let results = store.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(results[0].0, 1);
        assert!((results[1].1 - 5.0).abs() < 1e-5);
    }
}
