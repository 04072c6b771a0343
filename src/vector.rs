//! Persisted dense nearest-neighbour index over chunk embeddings.
//!
//! A flat inner-product index: vectors are unit-normalized on insert, so
//! inner product equals cosine similarity, and search is a brute-force scan
//! — exact, branch-free, and fast enough for a single node's chunk count.
//! Like the lexical index, readers go through an [`arc_swap::ArcSwap`]
//! snapshot; the single writer clones, mutates, persists, then swaps. The
//! index file is rewritten after every mutation.

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    dims: usize,
    ids: Vec<i64>,
    /// Row-major, `ids.len() * dims` values.
    vectors: Vec<f32>,
}

impl Snapshot {
    fn empty(dims: usize) -> Self {
        Self {
            dims,
            ids: Vec::new(),
            vectors: Vec::new(),
        }
    }

    fn row(&self, slot: usize) -> &[f32] {
        &self.vectors[slot * self.dims..(slot + 1) * self.dims]
    }

    fn search(&self, query: &[f32], top_k: usize) -> Vec<i64> {
        if self.ids.is_empty() || top_k == 0 || query.len() != self.dims {
            return Vec::new();
        }
        let query = normalize(query);

        let mut scored: Vec<(i64, f32)> = self
            .ids
            .iter()
            .enumerate()
            .map(|(slot, &id)| (id, dot(&query, self.row(slot))))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(top_k);
        scored.into_iter().map(|(id, _)| id).collect()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = dot(vector, vector).sqrt();
    if norm <= f32::EPSILON {
        return vector.to_vec();
    }
    vector.iter().map(|v| v / norm).collect()
}

/// The process-wide vector index: one writer, many lock-free readers.
pub struct VectorIndex {
    snapshot: ArcSwap<Snapshot>,
    path: PathBuf,
}

impl VectorIndex {
    /// Open the index, loading the persisted file if present. A persisted
    /// index with a different dimensionality is discarded (the encoder
    /// changed; the indexer repopulates on the next cycle).
    pub fn open(path: &Path, dims: usize) -> Result<Self> {
        let snapshot = match std::fs::read(path) {
            Ok(bytes) => {
                let loaded: Snapshot = bincode::deserialize(&bytes)
                    .with_context(|| format!("corrupt vector index file {}", path.display()))?;
                if loaded.dims == dims {
                    loaded
                } else {
                    tracing::warn!(
                        persisted = loaded.dims,
                        configured = dims,
                        "vector index dimensionality changed, starting empty"
                    );
                    Snapshot::empty(dims)
                }
            }
            Err(_) => Snapshot::empty(dims),
        };
        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            path: path.to_path_buf(),
        })
    }

    /// Insert or replace vectors by chunk id. Vectors are unit-normalized
    /// before storage.
    pub fn upsert(&self, ids: &[i64], vectors: &[Vec<f32>]) -> Result<()> {
        if ids.len() != vectors.len() {
            bail!("upsert: {} ids but {} vectors", ids.len(), vectors.len());
        }
        let current = self.snapshot.load_full();
        for vector in vectors {
            if vector.len() != current.dims {
                bail!(
                    "upsert: expected {} dims, got {}",
                    current.dims,
                    vector.len()
                );
            }
        }

        let replace: HashSet<i64> = ids.iter().copied().collect();
        let mut next = Snapshot::empty(current.dims);
        for (slot, &id) in current.ids.iter().enumerate() {
            if !replace.contains(&id) {
                next.ids.push(id);
                next.vectors.extend_from_slice(current.row(slot));
            }
        }
        for (&id, vector) in ids.iter().zip(vectors) {
            next.ids.push(id);
            next.vectors.extend(normalize(vector));
        }

        self.persist(&next)?;
        self.snapshot.store(Arc::new(next));
        Ok(())
    }

    /// Drop vectors by chunk id; unknown ids are ignored.
    pub fn remove(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let current = self.snapshot.load_full();
        let doomed: HashSet<i64> = ids.iter().copied().collect();

        let mut next = Snapshot::empty(current.dims);
        for (slot, &id) in current.ids.iter().enumerate() {
            if !doomed.contains(&id) {
                next.ids.push(id);
                next.vectors.extend_from_slice(current.row(slot));
            }
        }

        self.persist(&next)?;
        self.snapshot.store(Arc::new(next));
        Ok(())
    }

    /// Top-k chunk ids by inner product with `query`, descending.
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<i64> {
        self.snapshot.load().search(query, top_k)
    }

    pub fn clear(&self) -> Result<()> {
        let dims = self.snapshot.load().dims;
        let empty = Snapshot::empty(dims);
        self.persist(&empty)?;
        self.snapshot.store(Arc::new(empty));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, chunk_id: i64) -> bool {
        self.snapshot.load().ids.contains(&chunk_id)
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = bincode::serialize(snapshot)?;
        std::fs::write(&self.path, bytes)
            .with_context(|| format!("failed to persist vector index to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DIMS: usize = 4;

    fn open_index(dir: &TempDir) -> VectorIndex {
        VectorIndex::open(&dir.path().join("vector_index.bin"), DIMS).unwrap()
    }

    #[test]
    fn test_search_returns_nearest_first() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index
            .upsert(
                &[1, 2, 3],
                &[
                    vec![1.0, 0.0, 0.0, 0.0],
                    vec![0.0, 1.0, 0.0, 0.0],
                    vec![0.7, 0.7, 0.0, 0.0],
                ],
            )
            .unwrap();

        let hits = index.search(&[1.0, 0.1, 0.0, 0.0], 2);
        assert_eq!(hits, vec![1, 3]);
    }

    #[test]
    fn test_upsert_replaces_existing_id() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index.upsert(&[1], &[vec![1.0, 0.0, 0.0, 0.0]]).unwrap();
        index.upsert(&[1], &[vec![0.0, 1.0, 0.0, 0.0]]).unwrap();

        assert_eq!(index.len(), 1);
        let hits = index.search(&[0.0, 1.0, 0.0, 0.0], 1);
        assert_eq!(hits, vec![1]);
    }

    #[test]
    fn test_remove_drops_ids() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index
            .upsert(
                &[1, 2],
                &[vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]],
            )
            .unwrap();
        index.remove(&[1, 999]).unwrap();

        assert_eq!(index.len(), 1);
        assert!(!index.contains(1));
        assert!(index.contains(2));
    }

    #[test]
    fn test_vectors_are_normalized() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        // Same direction, wildly different magnitudes.
        index
            .upsert(
                &[1, 2],
                &[vec![100.0, 0.0, 0.0, 0.0], vec![0.9, 0.45, 0.0, 0.0]],
            )
            .unwrap();

        let hits = index.search(&[1.0, 0.0, 0.0, 0.0], 2);
        assert_eq!(hits[0], 1, "magnitude must not dominate direction");
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        assert!(index.upsert(&[1], &[vec![1.0, 0.0]]).is_err());
        assert!(index.upsert(&[1, 2], &[vec![1.0; DIMS]]).is_err());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vector_index.bin");
        {
            let index = VectorIndex::open(&path, DIMS).unwrap();
            index.upsert(&[5], &[vec![0.0, 0.0, 1.0, 0.0]]).unwrap();
        }
        let reopened = VectorIndex::open(&path, DIMS).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.search(&[0.0, 0.0, 1.0, 0.0], 1), vec![5]);
    }

    #[test]
    fn test_dims_change_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vector_index.bin");
        {
            let index = VectorIndex::open(&path, DIMS).unwrap();
            index.upsert(&[5], &[vec![1.0; DIMS]]).unwrap();
        }
        let reopened = VectorIndex::open(&path, 8).unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn test_clear_empties_index() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index.upsert(&[1], &[vec![1.0; DIMS]]).unwrap();
        index.clear().unwrap();
        assert!(index.is_empty());
        assert!(index.search(&[1.0; DIMS], 5).is_empty());
    }
}
