//! In-memory BM25 index over chunk contents, with on-disk persistence.
//!
//! The index text for a chunk is its content augmented with the document
//! title, author, and source type name, so queries for "jira deploy notes
//! by dana" have something to bite on beyond the chunk body.
//!
//! The whole index is rebuilt from the store after every document insert or
//! removal; at single-node chunk counts a rebuild is cheap and keeps the
//! index trivially consistent with the store. Readers load an immutable
//! snapshot through [`arc_swap::ArcSwap`] — a rebuild never blocks queries
//! and a query observes either the pre- or post-rebuild state, never a torn
//! one. The snapshot is serialized to `bm25_index.bin` after every rebuild
//! and reloaded at startup.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const K1: f32 = 1.5;
const B: f32 = 0.75;

/// What one chunk contributes to the index.
#[derive(Debug, Clone)]
pub struct LexicalEntry {
    pub chunk_id: i64,
    pub content: String,
    pub title: String,
    pub author: String,
    pub source_type: String,
}

impl LexicalEntry {
    fn index_text(&self) -> String {
        let mut text = self.content.clone();
        for extra in [&self.title, &self.author, &self.source_type] {
            if !extra.is_empty() {
                text.push(' ');
                text.push_str(extra);
            }
        }
        text
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Posting {
    /// Index into `chunk_ids` / `lengths`.
    slot: u32,
    tf: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    chunk_ids: Vec<i64>,
    lengths: Vec<u32>,
    avg_length: f32,
    postings: HashMap<String, Vec<Posting>>,
}

impl Snapshot {
    fn build(entries: &[LexicalEntry]) -> Self {
        let mut chunk_ids = Vec::with_capacity(entries.len());
        let mut lengths = Vec::with_capacity(entries.len());
        let mut postings: HashMap<String, Vec<Posting>> = HashMap::new();

        for (slot, entry) in entries.iter().enumerate() {
            let tokens = tokenize(&entry.index_text());
            chunk_ids.push(entry.chunk_id);
            lengths.push(tokens.len() as u32);

            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_insert(0) += 1;
            }
            for (token, count) in tf {
                postings.entry(token).or_default().push(Posting {
                    slot: slot as u32,
                    tf: count,
                });
            }
        }

        let avg_length = if lengths.is_empty() {
            0.0
        } else {
            lengths.iter().sum::<u32>() as f32 / lengths.len() as f32
        };

        Self {
            chunk_ids,
            lengths,
            avg_length,
            postings,
        }
    }

    fn search(&self, query: &str, top_k: usize) -> Vec<i64> {
        if self.chunk_ids.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let n = self.chunk_ids.len() as f32;
        let mut scores: HashMap<u32, f32> = HashMap::new();

        for token in tokenize(query) {
            let Some(postings) = self.postings.get(&token) else {
                continue;
            };
            let df = postings.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for posting in postings {
                let tf = posting.tf as f32;
                let len = self.lengths[posting.slot as usize] as f32;
                let norm = K1 * (1.0 - B + B * len / self.avg_length.max(1.0));
                let contribution = idf * tf * (K1 + 1.0) / (tf + norm);
                *scores.entry(posting.slot).or_insert(0.0) += contribution;
            }
        }

        let mut ranked: Vec<(u32, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(top_k);
        ranked
            .into_iter()
            .map(|(slot, _)| self.chunk_ids[slot as usize])
            .collect()
    }
}

/// Lowercased alphanumeric runs; everything else is a separator.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// The process-wide lexical index: one writer, many lock-free readers.
pub struct LexicalIndex {
    snapshot: ArcSwap<Snapshot>,
    path: PathBuf,
}

impl LexicalIndex {
    /// Open the index, loading the persisted snapshot if one exists.
    pub fn open(path: &Path) -> Result<Self> {
        let snapshot = match std::fs::read(path) {
            Ok(bytes) => bincode::deserialize(&bytes)
                .with_context(|| format!("corrupt lexical index file {}", path.display()))?,
            Err(_) => Snapshot::default(),
        };
        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            path: path.to_path_buf(),
        })
    }

    /// Rebuild from the full chunk set and persist.
    pub fn rebuild(&self, entries: &[LexicalEntry]) -> Result<()> {
        let snapshot = Snapshot::build(entries);
        self.persist(&snapshot)?;
        self.snapshot.store(Arc::new(snapshot));
        Ok(())
    }

    /// Top-k chunk ids by BM25 score, descending.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<i64> {
        self.snapshot.load().search(query, top_k)
    }

    pub fn clear(&self) -> Result<()> {
        let empty = Snapshot::default();
        self.persist(&empty)?;
        self.snapshot.store(Arc::new(empty));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().chunk_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, chunk_id: i64) -> bool {
        self.snapshot.load().chunk_ids.contains(&chunk_id)
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = bincode::serialize(snapshot)?;
        std::fs::write(&self.path, bytes)
            .with_context(|| format!("failed to persist lexical index to {}", self.path.display()))
    }
}
