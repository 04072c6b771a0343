//! Background indexer: drains the index queue into the store and both
//! indexes.
//!
//! One dedicated loop consumes document batches via `drain`, then per
//! batch:
//!
//! 1. Remove any stored document with a matching `(source_id, external_id)`
//!    — one transaction — and drop its chunk vectors, so a re-indexed
//!    document exists exactly once.
//! 2. Split content into chunks and insert documents, children, and chunks
//!    — a second transaction.
//! 3. Rebuild the lexical index from the store, encode the new chunks, and
//!    upsert them into the vector index.
//! 4. Ack every queue item individually.
//!
//! Acks come last: if anything in 1–3 fails the batch is nacked and
//! re-delivered, so a chunk id present in either index always has a chunk
//! row behind it and every chunk row reaches both indexes within one cycle.

use anyhow::Result;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{ChunkingConfig, IndexerConfig};
use crate::lexical::LexicalIndex;
use crate::ml::TextEncoder;
use crate::models::DocumentRecord;
use crate::queue::{IndexQueue, Leased};
use crate::registry::SourceRegistry;
use crate::store::Store;
use crate::vector::VectorIndex;

/// Live progress counters, read by `GET /status`.
#[derive(Debug, Default)]
pub struct IndexingStats {
    in_flight: AtomicUsize,
    total_indexed: AtomicU64,
}

impl IndexingStats {
    /// Documents in the batch currently being indexed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn total_indexed(&self) -> u64 {
        self.total_indexed.load(Ordering::Relaxed)
    }
}

pub struct Indexer {
    pub store: Arc<Store>,
    pub index_queue: Arc<IndexQueue>,
    pub lexical: Arc<LexicalIndex>,
    pub vector: Arc<VectorIndex>,
    pub encoder: Arc<dyn TextEncoder>,
    pub registry: Arc<SourceRegistry>,
    pub chunking: ChunkingConfig,
    pub config: IndexerConfig,
    pub stats: Arc<IndexingStats>,
}

impl Indexer {
    /// Spawn the indexing loop.
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            info!("indexer started");
            let drain_timeout = Duration::from_millis(self.config.drain_timeout_ms);
            loop {
                let batch = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    batch = self.index_queue.drain(self.config.batch_max, drain_timeout) => batch,
                };

                let batch = match batch {
                    Ok(batch) if batch.is_empty() => continue,
                    Ok(batch) => batch,
                    Err(err) => {
                        error!(%err, "index queue drain failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                self.stats.in_flight.store(batch.len(), Ordering::Relaxed);
                info!(count = batch.len(), "indexing document batch");

                let docs: Vec<&DocumentRecord> = batch.iter().map(|l| &l.item).collect();
                match self.index_documents(&docs).await {
                    Ok(()) => self.ack_batch(&batch).await,
                    Err(err) => {
                        error!(%err, count = batch.len(),
                               "indexing batch failed, re-queueing");
                        self.nack_batch(&batch).await;
                    }
                }
                self.stats.in_flight.store(0, Ordering::Relaxed);
            }
            info!("indexer stopped");
        })
    }

    /// Index one batch end to end. Nothing is acked in here; the caller
    /// acks only when the whole batch lands.
    pub async fn index_documents(&self, docs: &[&DocumentRecord]) -> Result<()> {
        // Two crawl tasks may emit the same document into one batch; the
        // last copy wins, or the insert would trip the unique constraint.
        let mut slot_by_key: HashMap<(i64, &str), usize> = HashMap::new();
        let mut deduped: Vec<&DocumentRecord> = Vec::new();
        for doc in docs {
            match slot_by_key.entry((doc.source_id, doc.external_id.as_str())) {
                Entry::Occupied(entry) => deduped[*entry.get()] = doc,
                Entry::Vacant(entry) => {
                    entry.insert(deduped.len());
                    deduped.push(doc);
                }
            }
        }
        let docs = &deduped[..];

        // Step 1: displace earlier copies.
        let mut keys = Vec::new();
        for doc in docs {
            keys.push((doc.source_id, doc.external_id.clone()));
            for child in &doc.children {
                keys.push((child.source_id, child.external_id.clone()));
            }
        }
        let displaced = self.store.remove_documents_matching(&keys).await?;
        if !displaced.is_empty() {
            self.vector.remove(&displaced)?;
        }

        // Step 2: insert the new trees and their chunks.
        let owned: Vec<DocumentRecord> = docs.iter().map(|d| (*d).clone()).collect();
        let inserted = self
            .store
            .insert_document_trees(&owned, &self.chunking)
            .await?;

        // Step 3: refresh both indexes before anything is acked.
        self.lexical.rebuild(&self.store.lexical_entries().await?)?;

        if !inserted.is_empty() {
            let ids: Vec<i64> = inserted.iter().map(|c| c.id).collect();
            let texts: Vec<String> = inserted
                .iter()
                .map(|c| {
                    if c.title.is_empty() {
                        c.content.clone()
                    } else {
                        format!("{}; {}", c.content, c.title)
                    }
                })
                .collect();
            let vectors = self.encoder.encode(&texts).await?;
            self.vector.upsert(&ids, &vectors)?;
        }

        info!(
            documents = docs.len(),
            chunks = inserted.len(),
            "indexed batch"
        );
        Ok(())
    }

    async fn ack_batch(&self, batch: &[Leased<DocumentRecord>]) {
        let mut per_source: HashMap<i64, u64> = HashMap::new();
        for leased in batch {
            if let Err(err) = self.index_queue.ack(leased.id).await {
                error!(%err, id = leased.id, "failed to ack indexed document");
            }
            *per_source.entry(leased.item.source_id).or_insert(0) += 1;
        }
        for (source_id, count) in per_source {
            if let Some(handle) = self.registry.get_instance(source_id).await {
                handle.record_indexed(count);
            }
        }
        self.stats
            .total_indexed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
    }

    async fn nack_batch(&self, batch: &[Leased<DocumentRecord>]) {
        for leased in batch {
            if let Err(err) = self.index_queue.nack(leased.id).await {
                error!(%err, id = leased.id, "failed to nack document");
            }
        }
    }
}
