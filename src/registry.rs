//! Source registry and lifecycle.
//!
//! The registry owns two maps: connector *classes* by name (populated from
//! the discovered connector kinds at startup, each upserted as a SourceType
//! row) and connector *instances* by source id (restored from the store at
//! startup, mutated by create/delete).
//!
//! The hour-gate and swallow-errors semantics of [`SourceHandle::index`]
//! live here rather than in connector code, so every connector gets them
//! for free.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::connector::{Connector, ConnectorClass, SourceContext};
use crate::error::ConnectorError;
use crate::queue::{IndexQueue, TaskQueue};
use crate::ratelimit::RateLimiter;
use crate::store::{ChunkRemovalHook, Store};

/// A live connector instance plus the framework state wrapped around it.
pub struct SourceHandle {
    pub id: i64,
    pub type_name: String,
    connector: Box<dyn Connector>,
    ctx: Arc<SourceContext>,
    store: Arc<Store>,
    last_task_time: Mutex<Option<DateTime<Utc>>>,
    indexed_docs: AtomicU64,
    failed_tasks: AtomicU64,
}

impl SourceHandle {
    pub fn context(&self) -> &SourceContext {
        &self.ctx
    }

    pub fn record_indexed(&self, count: u64) {
        self.indexed_docs.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failed_task(&self) {
        self.failed_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn indexed_docs(&self) -> u64 {
        self.indexed_docs.load(Ordering::Relaxed)
    }

    pub fn failed_tasks(&self) -> u64 {
        self.failed_tasks.load(Ordering::Relaxed)
    }

    /// Kick off a crawl of this source.
    ///
    /// Skipped when a task ran within the last hour and `force` is false.
    /// `last_indexed_at` is moved to now in the store *before* the feed, so
    /// a crash mid-crawl re-fetches rather than misses. Errors are logged,
    /// never propagated; a broken source must not take the scheduler down.
    pub async fn index(&self, force: bool) {
        if !force {
            let last = *self.last_task_time.lock().unwrap();
            if let Some(last) = last {
                if Utc::now() - last < Duration::hours(1) {
                    info!(source_id = self.id, "skipping crawl, tasks ran recently");
                    return;
                }
            }
        }

        if let Err(err) = self.store.touch_last_indexed(self.id, Utc::now()).await {
            error!(source_id = self.id, %err, "failed to stamp last_indexed_at");
            return;
        }

        if let Err(err) = self.connector.feed_new_documents().await {
            error!(source_id = self.id, %err, "crawl seeding failed");
        }
    }

    /// Execute one queued crawl step. Called by workers.
    pub async fn run_task(
        &self,
        method: &str,
        kwargs: &Map<String, Value>,
    ) -> Result<(), ConnectorError> {
        *self.last_task_time.lock().unwrap() = Some(Utc::now());
        self.connector.dispatch(method, kwargs).await
    }

    /// When this source last ran (or was scheduled to run) a crawl,
    /// according to the store watermark loaded at construction.
    pub fn last_index_time(&self) -> DateTime<Utc> {
        self.ctx.last_index_time()
    }
}

/// Process-wide registry of connector classes and configured instances.
pub struct SourceRegistry {
    classes: HashMap<String, Arc<dyn ConnectorClass>>,
    instances: RwLock<HashMap<i64, Arc<SourceHandle>>>,
    store: Arc<Store>,
    tasks: Arc<TaskQueue>,
    index_queue: Arc<IndexQueue>,
}

impl SourceRegistry {
    pub fn new(
        classes: Vec<Arc<dyn ConnectorClass>>,
        store: Arc<Store>,
        tasks: Arc<TaskQueue>,
        index_queue: Arc<IndexQueue>,
    ) -> Self {
        let classes = classes
            .into_iter()
            .map(|class| (class.name().to_string(), class))
            .collect();
        Self {
            classes,
            instances: RwLock::new(HashMap::new()),
            store,
            tasks,
            index_queue,
        }
    }

    /// Upsert a SourceType row per class and restore instances for every
    /// stored source. A source whose class is no longer compiled in is
    /// skipped with a warning, not an error.
    pub async fn bootstrap(&self) -> Result<()> {
        for class in self.classes.values() {
            self.store
                .upsert_source_type(class.name(), class.display_name(), &class.config_fields())
                .await?;
        }

        let sources = self.store.load_sources().await?;
        let mut instances = self.instances.write().await;
        for source in sources {
            let Some(class) = self.classes.get(&source.type_name) else {
                warn!(source_id = source.id, type_name = %source.type_name,
                      "stored source has no registered connector class, skipping");
                continue;
            };
            match self.build_handle(class, source.id, source.config, source.last_indexed_at) {
                Ok(handle) => {
                    instances.insert(source.id, handle);
                }
                Err(err) => {
                    warn!(source_id = source.id, %err, "failed to restore connector instance");
                }
            }
        }
        info!(count = instances.len(), "restored connector instances");
        Ok(())
    }

    /// Validate and persist a new source, then register its live instance.
    pub async fn create_source(
        &self,
        type_name: &str,
        config: Value,
    ) -> Result<Arc<SourceHandle>, ConnectorError> {
        let class = self
            .classes
            .get(type_name)
            .ok_or_else(|| {
                ConnectorError::Known(format!("source type {} does not exist", type_name))
            })?
            .clone();

        class.validate_config(&config).await?;

        let stored_type = self
            .store
            .source_type_by_name(type_name)
            .await?
            .ok_or_else(|| {
                ConnectorError::Known(format!("source type {} is not registered", type_name))
            })?;

        let source_id = self.store.insert_source(stored_type.id, &config).await?;
        let handle = self.build_handle(&class, source_id, config, 0)?;
        self.instances.write().await.insert(source_id, handle.clone());

        info!(source_id, type_name, "source connected");
        Ok(handle)
    }

    /// Delete a source: cascade in the store (indexes notified through
    /// `hook` inside the deleting transaction), then drop the instance.
    pub async fn delete_source(
        &self,
        source_id: i64,
        hook: &dyn ChunkRemovalHook,
    ) -> Result<(), ConnectorError> {
        if !self.store.source_exists(source_id).await? {
            return Err(ConnectorError::Known(format!(
                "data source {} does not exist",
                source_id
            )));
        }
        self.store.delete_source(source_id, hook).await?;
        self.instances.write().await.remove(&source_id);
        info!(source_id, "source deleted");
        Ok(())
    }

    pub async fn get_instance(&self, source_id: i64) -> Option<Arc<SourceHandle>> {
        self.instances.read().await.get(&source_id).cloned()
    }

    pub fn get_class(&self, name: &str) -> Option<Arc<dyn ConnectorClass>> {
        self.classes.get(name).cloned()
    }

    pub fn classes(&self) -> Vec<Arc<dyn ConnectorClass>> {
        let mut classes: Vec<_> = self.classes.values().cloned().collect();
        classes.sort_by_key(|c| c.name());
        classes
    }

    pub async fn instances(&self) -> Vec<Arc<SourceHandle>> {
        let mut handles: Vec<_> = self.instances.read().await.values().cloned().collect();
        handles.sort_by_key(|h| h.id);
        handles
    }

    fn build_handle(
        &self,
        class: &Arc<dyn ConnectorClass>,
        source_id: i64,
        config: Value,
        last_indexed_at: i64,
    ) -> Result<Arc<SourceHandle>, ConnectorError> {
        let ctx = Arc::new(SourceContext::new(
            source_id,
            config,
            last_indexed_at,
            RateLimiter::per_second(class.rate_limit_per_second()),
            self.tasks.clone(),
            self.index_queue.clone(),
        ));
        let connector = class.build(ctx.clone())?;
        Ok(Arc::new(SourceHandle {
            id: source_id,
            type_name: class.name().to_string(),
            connector,
            ctx,
            store: self.store.clone(),
            last_task_time: Mutex::new(None),
            indexed_docs: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConfigField;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct NullHook;

    impl ChunkRemovalHook for NullHook {
        fn remove_chunks(&self, _chunk_ids: &[i64]) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingClass {
        feeds: Arc<AtomicUsize>,
    }

    struct CountingConnector {
        feeds: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectorClass for CountingClass {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn display_name(&self) -> &'static str {
            "Counting"
        }

        fn config_fields(&self) -> Vec<ConfigField> {
            vec![ConfigField::new("token")]
        }

        async fn validate_config(&self, config: &Value) -> Result<(), ConnectorError> {
            if config.get("token").and_then(Value::as_str).is_none() {
                return Err(ConnectorError::InvalidConfig("token is required".into()));
            }
            Ok(())
        }

        fn build(&self, _ctx: Arc<SourceContext>) -> Result<Box<dyn Connector>, ConnectorError> {
            Ok(Box::new(CountingConnector {
                feeds: self.feeds.clone(),
            }))
        }
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn feed_new_documents(&self) -> Result<(), ConnectorError> {
            self.feeds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn dispatch(
            &self,
            method: &str,
            _kwargs: &Map<String, Value>,
        ) -> Result<(), ConnectorError> {
            Err(ConnectorError::UnknownMethod(method.to_string()))
        }
    }

    async fn registry(dir: &TempDir, feeds: Arc<AtomicUsize>) -> SourceRegistry {
        let store = Arc::new(Store::open(&dir.path().join("db.sqlite3")).await.unwrap());
        let tasks = Arc::new(TaskQueue::open(&dir.path().join("t.sqlite3")).await.unwrap());
        let index_queue =
            Arc::new(IndexQueue::open(&dir.path().join("i.sqlite3")).await.unwrap());
        let registry = SourceRegistry::new(
            vec![Arc::new(CountingClass { feeds })],
            store,
            tasks,
            index_queue,
        );
        registry.bootstrap().await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_bootstrap_registers_source_type() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Arc::default()).await;
        let stored = registry
            .store
            .source_type_by_name("counting")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.display_name, "Counting");
        assert_eq!(stored.config_fields.len(), 1);
    }

    #[tokio::test]
    async fn test_create_source_validates_first() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Arc::default()).await;

        let rejected = registry
            .create_source("counting", serde_json::json!({}))
            .await;
        assert!(matches!(rejected, Err(ConnectorError::InvalidConfig(_))));
        // Rejected config must not leave a row behind.
        assert!(registry.store.load_sources().await.unwrap().is_empty());

        let handle = registry
            .create_source("counting", serde_json::json!({"token": "T"}))
            .await
            .unwrap();
        assert!(registry.get_instance(handle.id).await.is_some());
    }

    #[tokio::test]
    async fn test_create_source_unknown_type_is_known_error() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Arc::default()).await;
        let result = registry
            .create_source("missing", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(ConnectorError::Known(_))));
    }

    #[tokio::test]
    async fn test_index_hour_gate() {
        let dir = TempDir::new().unwrap();
        let feeds = Arc::new(AtomicUsize::new(0));
        let registry = registry(&dir, feeds.clone()).await;
        let handle = registry
            .create_source("counting", serde_json::json!({"token": "T"}))
            .await
            .unwrap();

        handle.index(true).await;
        assert_eq!(feeds.load(Ordering::SeqCst), 1);

        // A crawl task just ran; a non-forced index within the hour skips.
        handle
            .run_task("anything", &Map::new())
            .await
            .expect_err("unknown method");
        handle.index(false).await;
        assert_eq!(feeds.load(Ordering::SeqCst), 1);

        handle.index(true).await;
        assert_eq!(feeds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_index_stamps_store_watermark() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Arc::default()).await;
        let handle = registry
            .create_source("counting", serde_json::json!({"token": "T"}))
            .await
            .unwrap();

        handle.index(true).await;
        let sources = registry.store.load_sources().await.unwrap();
        assert!(sources[0].last_indexed_at > 0);
    }

    #[tokio::test]
    async fn test_delete_source_removes_instance() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Arc::default()).await;
        let handle = registry
            .create_source("counting", serde_json::json!({"token": "T"}))
            .await
            .unwrap();

        registry.delete_source(handle.id, &NullHook).await.unwrap();
        assert!(registry.get_instance(handle.id).await.is_none());

        let again = registry.delete_source(handle.id, &NullHook).await;
        assert!(matches!(again, Err(ConnectorError::Known(_))));
    }

    #[tokio::test]
    async fn test_instances_survive_restart() {
        let dir = TempDir::new().unwrap();
        let id = {
            let registry = registry(&dir, Arc::default()).await;
            registry
                .create_source("counting", serde_json::json!({"token": "T"}))
                .await
                .unwrap()
                .id
        };

        let reopened = registry(&dir, Arc::default()).await;
        assert!(reopened.get_instance(id).await.is_some());
    }
}
