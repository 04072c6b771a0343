//! The connector framework: the contract every source adapter implements.
//!
//! A connector comes in two parts, mirroring what is known per *kind*
//! versus per *configured instance*:
//!
//! - [`ConnectorClass`] — one value per connector kind, registered at
//!   startup. Declares the config schema, validates candidate configs
//!   against the live upstream API, lists selectable locations, and builds
//!   instances.
//! - [`Connector`] — one value per configured source. Seeds crawl work via
//!   [`Connector::feed_new_documents`] and executes queued crawl steps via
//!   [`Connector::dispatch`], which matches on the connector's own declared
//!   method names — the framework never reflects over arbitrary methods.
//!
//! Instances talk back to the framework through their [`SourceContext`]:
//! `enqueue` records follow-up crawl steps on the task queue and `emit`
//! pushes finished document groups onto the indexing queue. Each context
//! carries the incremental watermark (`last_index_time`) and the
//! per-source token-bucket limiter.
//!
//! Crawl sub-tasks must be self-contained: workers are source-agnostic and
//! nothing orders tasks within a source, so every kwarg a step needs rides
//! in the task itself.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

use crate::error::ConnectorError;
use crate::models::{ConfigField, DocumentRecord, Location, TaskItem};
use crate::queue::{IndexQueue, TaskQueue};
use crate::ratelimit::RateLimiter;

/// Class-level capabilities of a connector kind.
#[async_trait]
pub trait ConnectorClass: Send + Sync {
    /// Stable identifier; doubles as the SourceType name.
    fn name(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    /// Ordered field list rendered by the UI when connecting a source.
    fn config_fields(&self) -> Vec<ConfigField>;

    /// True when the UI must prompt for locations before saving.
    fn has_prerequisites(&self) -> bool {
        false
    }

    /// Sustained outbound call budget for one configured source. The
    /// framework attaches a token bucket of this rate to every instance.
    fn rate_limit_per_second(&self) -> f64 {
        10.0
    }

    /// Validate a candidate config by actually exercising the upstream API.
    async fn validate_config(&self, config: &Value) -> Result<(), ConnectorError>;

    /// Selectable sub-partitions for UIs that scope what gets indexed.
    async fn list_locations(&self, _config: &Value) -> Result<Vec<Location>, ConnectorError> {
        Ok(Vec::new())
    }

    /// Fetch an author avatar as a data URI, if this kind can. Called at
    /// search-result assembly; implementations must be fast and cached.
    async fn author_image(&self, _config: &Value, _image_url: &str) -> Option<String> {
        None
    }

    /// Construct a connector instance bound to a configured source.
    fn build(&self, ctx: Arc<SourceContext>) -> Result<Box<dyn Connector>, ConnectorError>;
}

/// Instance-level behavior of a configured source.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Seed crawl tasks for anything changed since the watermark. Invoked
    /// by the scheduler; must be idempotent across restarts.
    async fn feed_new_documents(&self) -> Result<(), ConnectorError>;

    /// Execute one queued crawl step by method name. Unknown names must
    /// fail with [`ConnectorError::UnknownMethod`].
    async fn dispatch(
        &self,
        method: &str,
        kwargs: &Map<String, Value>,
    ) -> Result<(), ConnectorError>;
}

/// The framework-side state a connector instance operates through.
pub struct SourceContext {
    pub source_id: i64,
    pub config: Value,
    pub limiter: RateLimiter,
    last_index_time: Mutex<DateTime<Utc>>,
    tasks: Arc<TaskQueue>,
    index_queue: Arc<IndexQueue>,
}

impl SourceContext {
    pub fn new(
        source_id: i64,
        config: Value,
        last_indexed_at: i64,
        limiter: RateLimiter,
        tasks: Arc<TaskQueue>,
        index_queue: Arc<IndexQueue>,
    ) -> Self {
        let watermark = Utc
            .timestamp_opt(last_indexed_at, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
        Self {
            source_id,
            config,
            limiter,
            last_index_time: Mutex::new(watermark),
            tasks,
            index_queue,
        }
    }

    /// The incremental watermark: records untouched since this instant can
    /// be skipped.
    pub fn last_index_time(&self) -> DateTime<Utc> {
        *self.last_index_time.lock().unwrap()
    }

    pub fn set_last_index_time(&self, at: DateTime<Utc>) {
        *self.last_index_time.lock().unwrap() = at;
    }

    /// Record a follow-up crawl step. `kwargs` must be a JSON object.
    pub async fn enqueue(&self, method: &str, kwargs: Value) -> Result<()> {
        let kwargs = match kwargs {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => anyhow::bail!("task kwargs must be a JSON object, got {}", other),
        };
        self.tasks
            .put(&TaskItem::new(self.source_id, method, kwargs))
            .await
    }

    /// Push one finished document group (parent plus children) onto the
    /// indexing queue.
    pub async fn emit(&self, mut doc: DocumentRecord) -> Result<()> {
        doc.source_id = self.source_id;
        for child in &mut doc.children {
            child.source_id = self.source_id;
        }
        self.index_queue.put(&doc).await
    }

    /// True when `doc_time` predates the watermark and the record can be
    /// skipped.
    pub fn is_prior_to_last_index(&self, doc_time: DateTime<Utc>) -> bool {
        doc_time < self.last_index_time()
    }
}

/// Pull a required string kwarg out of a task payload.
pub fn required_str<'a>(
    kwargs: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a str, ConnectorError> {
    kwargs
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ConnectorError::Other(anyhow::anyhow!("task kwarg '{}' missing", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn context(dir: &TempDir) -> (Arc<SourceContext>, Arc<TaskQueue>, Arc<IndexQueue>) {
        let tasks = Arc::new(TaskQueue::open(&dir.path().join("t.sqlite3")).await.unwrap());
        let index_queue = Arc::new(IndexQueue::open(&dir.path().join("i.sqlite3")).await.unwrap());
        let ctx = Arc::new(SourceContext::new(
            5,
            serde_json::json!({"url": "https://wiki"}),
            0,
            RateLimiter::per_second(100.0),
            tasks.clone(),
            index_queue.clone(),
        ));
        (ctx, tasks, index_queue)
    }

    #[tokio::test]
    async fn test_enqueue_tags_source_id() {
        let dir = TempDir::new().unwrap();
        let (ctx, tasks, _) = context(&dir).await;

        ctx.enqueue("crawl_space", serde_json::json!({"space": "ENG"}))
            .await
            .unwrap();

        let leased = tasks
            .get(std::time::Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.item.source_id, 5);
        assert_eq!(leased.item.method, "crawl_space");
        assert_eq!(leased.item.kwargs["space"], "ENG");
    }

    #[tokio::test]
    async fn test_enqueue_rejects_non_object_kwargs() {
        let dir = TempDir::new().unwrap();
        let (ctx, _, _) = context(&dir).await;
        assert!(ctx
            .enqueue("crawl", serde_json::json!(["not", "a", "map"]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_emit_stamps_source_on_children() {
        let dir = TempDir::new().unwrap();
        let (ctx, _, index_queue) = context(&dir).await;

        let mut doc = crate::models::DocumentRecord {
            source_id: 0,
            external_id: "I-1".to_string(),
            kind: crate::models::DocumentKind::Issue,
            file_kind: None,
            title: "Bug".to_string(),
            content: "Crash".to_string(),
            author: "Dana".to_string(),
            author_image_url: None,
            location: "Tracker".to_string(),
            url: "https://t/1".to_string(),
            timestamp: Utc::now(),
            status: Some("open".to_string()),
            is_active: Some(true),
            children: Vec::new(),
        };
        doc.children.push(crate::models::DocumentRecord {
            external_id: "C-1".to_string(),
            kind: crate::models::DocumentKind::Comment,
            ..doc.clone()
        });

        ctx.emit(doc).await.unwrap();

        let leased = index_queue
            .get(std::time::Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.item.source_id, 5);
        assert_eq!(leased.item.children[0].source_id, 5);
    }

    #[tokio::test]
    async fn test_watermark_comparison() {
        let dir = TempDir::new().unwrap();
        let (ctx, _, _) = context(&dir).await;

        let before = Utc.with_ymd_and_hms(1969, 12, 1, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(ctx.is_prior_to_last_index(before));
        assert!(!ctx.is_prior_to_last_index(after));

        ctx.set_last_index_time(after);
        assert!(ctx.is_prior_to_last_index(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()));
    }
}
