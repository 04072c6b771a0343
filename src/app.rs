//! The application root: every process-wide component, owned in one place.
//!
//! There is no global mutable state. `App::bootstrap` builds the store,
//! both queues, both indexes, and the source registry inside one value
//! that the HTTP handlers, workers, indexer, and scheduler all borrow.
//! Tests instantiate an independent `App` per run against a temp data
//! directory.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::connector::ConnectorClass;
use crate::connector_dir::DirClass;
use crate::connector_wiki::{WikiClass, WikiCloudClass};
use crate::error::ConnectorError;
use crate::indexer::{Indexer, IndexingStats};
use crate::lexical::LexicalIndex;
use crate::ml::ModelSet;
use crate::queue::{IndexQueue, TaskQueue};
use crate::registry::SourceRegistry;
use crate::scheduler;
use crate::store::{ChunkRemovalHook, Store};
use crate::telemetry::{self, Counters};
use crate::vector::VectorIndex;
use crate::worker;

/// The connector kinds compiled into this build.
pub fn builtin_classes() -> Vec<Arc<dyn ConnectorClass>> {
    vec![
        Arc::new(DirClass),
        Arc::new(WikiClass::new()),
        Arc::new(WikiCloudClass::new()),
    ]
}

/// Queue depths and progress counters for `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub docs_in_indexing: usize,
    pub docs_left_to_index: u64,
}

pub struct App {
    pub config: AppConfig,
    pub store: Arc<Store>,
    pub task_queue: Arc<TaskQueue>,
    pub index_queue: Arc<IndexQueue>,
    pub lexical: Arc<LexicalIndex>,
    pub vector: Arc<VectorIndex>,
    pub registry: Arc<SourceRegistry>,
    pub models: ModelSet,
    pub stats: Arc<IndexingStats>,
    pub counters: Counters,
    pub install_id: String,
    shutdown: broadcast::Sender<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    /// Open every persistent component under the configured data directory
    /// and restore the source registry. Background loops are not started
    /// yet; call [`App::start_background`].
    pub async fn bootstrap(
        config: AppConfig,
        classes: Vec<Arc<dyn ConnectorClass>>,
        models: ModelSet,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;

        let store = Arc::new(Store::open(&config.store_path()).await?);
        let task_queue = Arc::new(TaskQueue::open(&config.task_queue_path()).await?);
        let index_queue = Arc::new(IndexQueue::open(&config.index_queue_path()).await?);
        let lexical = Arc::new(LexicalIndex::open(&config.lexical_index_path())?);
        let vector = Arc::new(VectorIndex::open(
            &config.vector_index_path(),
            models.encoder.dims(),
        )?);
        let install_id = telemetry::load_or_create_install_id(&config.install_id_path())?;

        let registry = Arc::new(SourceRegistry::new(
            classes,
            store.clone(),
            task_queue.clone(),
            index_queue.clone(),
        ));
        registry.bootstrap().await?;

        let (shutdown, _) = broadcast::channel(1);
        info!(data_dir = %config.data_dir.display(), %install_id, "application bootstrapped");

        Ok(Arc::new(Self {
            config,
            store,
            task_queue,
            index_queue,
            lexical,
            vector,
            registry,
            models,
            stats: Arc::new(IndexingStats::default()),
            counters: Counters::default(),
            install_id,
            shutdown,
            background: Mutex::new(Vec::new()),
        }))
    }

    /// Start the worker pool, the indexer, and the periodic scheduler.
    pub fn start_background(self: &Arc<Self>) {
        let mut handles = Vec::new();

        handles.extend(worker::spawn_workers(
            &self.config.workers,
            self.task_queue.clone(),
            self.registry.clone(),
            &self.shutdown,
        ));

        let indexer = Indexer {
            store: self.store.clone(),
            index_queue: self.index_queue.clone(),
            lexical: self.lexical.clone(),
            vector: self.vector.clone(),
            encoder: self.models.encoder.clone(),
            registry: self.registry.clone(),
            chunking: self.config.chunking.clone(),
            config: self.config.indexer.clone(),
            stats: self.stats.clone(),
        };
        handles.push(indexer.spawn(&self.shutdown));

        handles.push(scheduler::spawn_scheduler(
            self.store.clone(),
            self.registry.clone(),
            &self.shutdown,
        ));

        self.background.lock().unwrap().extend(handles);
    }

    /// Validate, persist, and register a new source, then crawl it
    /// immediately.
    pub async fn create_source(
        self: &Arc<Self>,
        type_name: &str,
        config: Value,
    ) -> Result<i64, ConnectorError> {
        let handle = self.registry.create_source(type_name, config).await?;
        self.counters.record_source_created();

        let crawl = handle.clone();
        tokio::spawn(async move {
            crawl.index(true).await;
        });
        Ok(handle.id)
    }

    /// Delete a source: store cascade with the vector index notified inside
    /// the transaction, then a lexical rebuild from what remains.
    pub async fn delete_source(&self, source_id: i64) -> Result<(), ConnectorError> {
        let hook = VectorRemovalHook {
            vector: &self.vector,
        };
        self.registry.delete_source(source_id, &hook).await?;

        let entries = self.store.lexical_entries().await.map_err(ConnectorError::Other)?;
        self.lexical.rebuild(&entries).map_err(ConnectorError::Other)?;
        Ok(())
    }

    /// Wipe both indexes and all documents and chunks. Sources stay.
    pub async fn clear_index(&self) -> Result<()> {
        self.store.clear_documents().await?;
        self.lexical.clear()?;
        self.vector.clear()?;
        info!("index cleared");
        Ok(())
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let queued = self.task_queue.len().await? + self.index_queue.len().await?;
        Ok(StatusReport {
            docs_in_indexing: self.stats.in_flight(),
            docs_left_to_index: queued,
        })
    }

    /// Signal every loop to stop and wait for them. In-flight queue items
    /// are left leased; they re-deliver on next start.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let handles: Vec<JoinHandle<()>> = self.background.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                error!(%err, "background task panicked during shutdown");
            }
        }
        info!("application stopped");
    }
}

struct VectorRemovalHook<'a> {
    vector: &'a VectorIndex,
}

impl ChunkRemovalHook for VectorRemovalHook<'_> {
    fn remove_chunks(&self, chunk_ids: &[i64]) -> Result<()> {
        self.vector.remove(chunk_ids)
    }
}
