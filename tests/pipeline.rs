//! End-to-end pipeline tests: a mock connector crawled by the real worker
//! pool, indexed by the real indexer, queried through the real pipeline.
//! Model seams are deterministic in-process implementations; each test
//! runs an independent application in a temp data directory.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use hivesearch::app::App;
use hivesearch::config::AppConfig;
use hivesearch::connector::{Connector, ConnectorClass, SourceContext};
use hivesearch::error::ConnectorError;
use hivesearch::ml::{AnswerSpan, ModelSet, PairScorer, SpanExtractor, TextEncoder};
use hivesearch::models::{ConfigField, DocumentKind, DocumentRecord};
use hivesearch::scheduler;
use hivesearch::search;

// ============ Deterministic model seams ============

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

struct BagEncoder;

#[async_trait]
impl TextEncoder for BagEncoder {
    fn dims(&self) -> usize {
        32
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; 32];
                for token in tokens(text) {
                    let bucket: usize =
                        token.bytes().map(|b| b as usize).sum::<usize>() % 32;
                    vector[bucket] += 1.0;
                }
                vector
            })
            .collect())
    }
}

/// Scores by query-token overlap, scaled onto the cross-encoder logit
/// range so the `(s + 12) / 24` calibration applies.
struct OverlapScorer;

#[async_trait]
impl PairScorer for OverlapScorer {
    async fn score(&self, pairs: &[(String, String)]) -> Result<Vec<f32>> {
        Ok(pairs
            .iter()
            .map(|(query, passage)| {
                let query_tokens = tokens(query);
                let passage_tokens = tokens(passage);
                if query_tokens.is_empty() {
                    return -12.0;
                }
                let matched = query_tokens
                    .iter()
                    .filter(|t| passage_tokens.contains(t))
                    .count();
                24.0 * matched as f32 / query_tokens.len() as f32 - 12.0
            })
            .collect())
    }
}

/// Answers with the span from the first to the last query-token match.
struct WindowExtractor;

#[async_trait]
impl SpanExtractor for WindowExtractor {
    async fn answer(&self, question: &str, contexts: &[String]) -> Result<Vec<AnswerSpan>> {
        let question_tokens = tokens(question);
        Ok(contexts
            .iter()
            .map(|context| {
                let lower = context.to_lowercase();
                let mut start = usize::MAX;
                let mut end = 0;
                for token in &question_tokens {
                    if let Some(at) = lower.find(token.as_str()) {
                        start = start.min(at);
                        end = end.max(at + token.len());
                    }
                }
                if start == usize::MAX {
                    AnswerSpan {
                        text: String::new(),
                        start: 0,
                        end: 0,
                    }
                } else {
                    AnswerSpan {
                        text: context[start..end].to_string(),
                        start,
                        end,
                    }
                }
            })
            .collect())
    }
}

fn test_models() -> ModelSet {
    ModelSet {
        encoder: Arc::new(BagEncoder),
        scorer_small: Arc::new(OverlapScorer),
        scorer_large: Arc::new(OverlapScorer),
        extractor: Arc::new(WindowExtractor),
    }
}

// ============ Mock connector ============

struct MockClass {
    docs: Arc<Mutex<Vec<DocumentRecord>>>,
    flaky: bool,
    dispatch_failures: Arc<AtomicUsize>,
}

struct MockConnector {
    ctx: Arc<SourceContext>,
    docs: Arc<Mutex<Vec<DocumentRecord>>>,
    flaky: bool,
    dispatch_failures: Arc<AtomicUsize>,
}

#[async_trait]
impl ConnectorClass for MockClass {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn display_name(&self) -> &'static str {
        "Mock"
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

    fn build(&self, ctx: Arc<SourceContext>) -> Result<Box<dyn Connector>, ConnectorError> {
        Ok(Box::new(MockConnector {
            ctx,
            docs: self.docs.clone(),
            flaky: self.flaky,
            dispatch_failures: self.dispatch_failures.clone(),
        }))
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn feed_new_documents(&self) -> Result<(), ConnectorError> {
        let method = if self.flaky { "emit_flaky" } else { "emit_all" };
        self.ctx.enqueue(method, json!({})).await?;
        Ok(())
    }

    async fn dispatch(
        &self,
        method: &str,
        _kwargs: &Map<String, Value>,
    ) -> Result<(), ConnectorError> {
        match method {
            "emit_all" => self.emit_all().await,
            "emit_flaky" => {
                let failures = self.dispatch_failures.fetch_add(1, Ordering::SeqCst);
                if failures < 2 {
                    return Err(ConnectorError::Transient("upstream 503".into()));
                }
                self.emit_all().await
            }
            other => Err(ConnectorError::UnknownMethod(other.to_string())),
        }
    }
}

impl MockConnector {
    async fn emit_all(&self) -> Result<(), ConnectorError> {
        let docs = self.docs.lock().unwrap().clone();
        for doc in docs {
            self.ctx.emit(doc).await?;
        }
        Ok(())
    }
}

fn doc(external_id: &str, title: &str, content: &str) -> DocumentRecord {
    DocumentRecord {
        source_id: 0,
        external_id: external_id.to_string(),
        kind: DocumentKind::Document,
        file_kind: None,
        title: title.to_string(),
        content: content.to_string(),
        author: "Dana".to_string(),
        author_image_url: None,
        location: "Demo Space".to_string(),
        url: "https://wiki.example.com/page".to_string(),
        timestamp: Utc.with_ymd_and_hms(2023, 3, 1, 12, 0, 0).unwrap(),
        status: None,
        is_active: None,
        children: Vec::new(),
    }
}

// ============ Harness ============

struct Harness {
    _dir: TempDir,
    app: Arc<App>,
    docs: Arc<Mutex<Vec<DocumentRecord>>>,
}

async fn harness(flaky: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = AppConfig::for_data_dir(dir.path());
    config.workers.count = 4;
    config.workers.poll_timeout_ms = 25;
    config.indexer.drain_timeout_ms = 25;

    let docs = Arc::new(Mutex::new(Vec::new()));
    let classes: Vec<Arc<dyn ConnectorClass>> = vec![Arc::new(MockClass {
        docs: docs.clone(),
        flaky,
        dispatch_failures: Arc::new(AtomicUsize::new(0)),
    })];

    let app = App::bootstrap(config, classes, test_models()).await.unwrap();
    app.start_background();

    Harness {
        _dir: dir,
        app,
        docs,
    }
}

impl Harness {
    fn set_docs(&self, docs: Vec<DocumentRecord>) {
        *self.docs.lock().unwrap() = docs;
    }

    /// Wait until at least `indexed` documents were acked and both queues
    /// are fully drained.
    async fn quiesce(&self, indexed: u64) {
        for _ in 0..600 {
            let status = self.app.status().await.unwrap();
            if self.app.stats.total_indexed() >= indexed
                && status.docs_left_to_index == 0
                && status.docs_in_indexing == 0
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("pipeline did not quiesce in time");
    }

    async fn assert_indexes_cover_store(&self) {
        let entries = self.app.store.lexical_entries().await.unwrap();
        assert!(!entries.is_empty() || self.app.lexical.is_empty());
        for entry in &entries {
            assert!(
                self.app.lexical.contains(entry.chunk_id),
                "chunk {} missing from lexical index",
                entry.chunk_id
            );
            assert!(
                self.app.vector.contains(entry.chunk_id),
                "chunk {} missing from vector index",
                entry.chunk_id
            );
        }
    }
}

// ============ Scenarios ============

#[tokio::test]
async fn test_create_crawl_search() {
    let h = harness(false).await;
    h.set_docs(vec![doc(
        "1",
        "Hello World",
        "The quick brown fox jumps over the lazy dog.",
    )]);

    let source_id = h
        .app
        .create_source("mock", json!({"token": "T"}))
        .await
        .unwrap();
    h.quiesce(1).await;

    let results = search::search_documents(&h.app, "quick fox", 5).await.unwrap();
    assert_eq!(results.len(), 1);
    let top = &results[0];
    assert!(top.content[0].bold);
    assert!(top.content[0].content.contains("quick brown fox"));
    assert_eq!(top.title, "Hello World");
    assert_eq!(top.data_source, "mock");
    assert!(top.url.contains(":~:text="));
    assert!(top.score > 0.0 && top.score <= 100.0);

    assert_eq!(h.app.store.count_documents(Some(source_id)).await.unwrap(), 1);
    let handle = h.app.registry.get_instance(source_id).await.unwrap();
    assert_eq!(handle.indexed_docs(), 1);
    assert_eq!(handle.failed_tasks(), 0);
    h.assert_indexes_cover_store().await;
    h.app.shutdown().await;
}

#[tokio::test]
async fn test_reindex_replaces_previous_copy() {
    let h = harness(false).await;
    h.set_docs(vec![doc(
        "1",
        "Hello World",
        "The quick brown fox jumps over the lazy dog.",
    )]);
    let source_id = h
        .app
        .create_source("mock", json!({"token": "T"}))
        .await
        .unwrap();
    h.quiesce(1).await;

    let old_chunks: Vec<i64> = h
        .app
        .store
        .lexical_entries()
        .await
        .unwrap()
        .iter()
        .map(|e| e.chunk_id)
        .collect();

    // Same external id, new title: the crawl must replace, not duplicate.
    h.set_docs(vec![doc(
        "1",
        "Hello World 2",
        "The quick brown fox jumps over the lazy dog.",
    )]);
    let handle = h.app.registry.get_instance(source_id).await.unwrap();
    handle.index(true).await;
    h.quiesce(2).await;

    assert_eq!(h.app.store.count_documents(Some(source_id)).await.unwrap(), 1);
    for old in &old_chunks {
        assert!(!h.app.lexical.contains(*old), "stale lexical entry {}", old);
        assert!(!h.app.vector.contains(*old), "stale vector entry {}", old);
    }
    h.assert_indexes_cover_store().await;

    let results = search::search_documents(&h.app, "quick fox", 5).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].title, "Hello World 2");
    h.app.shutdown().await;
}

#[tokio::test]
async fn test_delete_source_cascades() {
    let h = harness(false).await;
    h.set_docs(vec![doc(
        "1",
        "Hello World",
        "The quick brown fox jumps over the lazy dog.",
    )]);
    let source_id = h
        .app
        .create_source("mock", json!({"token": "T"}))
        .await
        .unwrap();
    h.quiesce(1).await;

    h.app.delete_source(source_id).await.unwrap();

    let results = search::search_documents(&h.app, "fox", 5).await.unwrap();
    assert!(results.is_empty());
    assert!(h.app.store.load_sources().await.unwrap().is_empty());
    assert_eq!(h.app.store.count_documents(None).await.unwrap(), 0);
    assert_eq!(h.app.store.count_chunks().await.unwrap(), 0);
    assert!(h.app.lexical.is_empty());
    assert!(h.app.vector.is_empty());
    h.app.shutdown().await;
}

#[tokio::test]
async fn test_flaky_task_retries_without_duplicates() {
    let h = harness(true).await;
    h.set_docs(vec![doc(
        "1",
        "Hello World",
        "The quick brown fox jumps over the lazy dog.",
    )]);
    let source_id = h
        .app
        .create_source("mock", json!({"token": "T"}))
        .await
        .unwrap();
    h.quiesce(1).await;

    // Failed twice, succeeded on the third attempt, document stored once.
    assert_eq!(h.app.store.count_documents(Some(source_id)).await.unwrap(), 1);
    assert_eq!(h.app.stats.total_indexed(), 1);
    assert_eq!(h.app.task_queue.dead_count().await.unwrap(), 0);
    h.app.shutdown().await;
}

#[tokio::test]
async fn test_parent_child_grouping() {
    let h = harness(false).await;
    let mut issue = doc("I-1", "Bug", "Something is broken in production.");
    issue.kind = DocumentKind::Issue;
    issue.status = Some("open".to_string());
    let mut comment = doc("C-1", "", "I found fox tracks");
    comment.kind = DocumentKind::Comment;
    issue.children.push(comment);
    h.set_docs(vec![issue]);

    h.app
        .create_source("mock", json!({"token": "T"}))
        .await
        .unwrap();
    h.quiesce(1).await;

    let results = search::search_documents(&h.app, "fox tracks", 5).await.unwrap();
    assert_eq!(results.len(), 1);
    let top = &results[0];
    assert_eq!(top.kind, "issue");
    assert_eq!(top.title, "Bug");
    assert_eq!(top.status.as_deref(), Some("open"));

    let child = top.child.as_ref().expect("comment grouped under issue");
    assert_eq!(child.kind, "comment");
    assert!(child.content[0].content.contains("fox tracks"));
    // The parent carries its best child's score.
    assert!(top.score >= child.score);
    h.app.shutdown().await;
}

#[tokio::test]
async fn test_scheduler_cadence() {
    let h = harness(false).await;
    h.set_docs(vec![doc("1", "Hello", "Some content here.")]);
    let source_id = h
        .app
        .create_source("mock", json!({"token": "T"}))
        .await
        .unwrap();
    h.quiesce(1).await;

    // 30 minutes stale: nothing to do.
    let half_hour_ago = Utc::now() - chrono::Duration::minutes(30);
    h.app
        .store
        .touch_last_indexed(source_id, half_hour_ago)
        .await
        .unwrap();
    let triggered = scheduler::run_tick(&h.app.store, &h.app.registry).await.unwrap();
    assert_eq!(triggered, 0);

    // 61 minutes stale: exactly one index call.
    let older = Utc::now() - chrono::Duration::minutes(61);
    h.app
        .store
        .touch_last_indexed(source_id, older)
        .await
        .unwrap();
    let triggered = scheduler::run_tick(&h.app.store, &h.app.registry).await.unwrap();
    assert_eq!(triggered, 1);
    h.app.shutdown().await;
}

#[tokio::test]
async fn test_search_results_sorted_and_bounded() {
    let h = harness(false).await;
    h.set_docs(vec![
        doc("1", "Fox One", "The fox ran over the hill and kept going."),
        doc("2", "Fox Two", "A fox and another fox walked past the fox den."),
        doc("3", "Dogs", "Only dogs in this one, nothing else at all."),
        doc("4", "Fox Four", "fox"),
    ]);
    h.app
        .create_source("mock", json!({"token": "T"}))
        .await
        .unwrap();
    h.quiesce(4).await;

    let results = search::search_documents(&h.app, "fox", 2).await.unwrap();
    assert!(results.len() <= 2);
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score, "results not sorted");
    }
    h.app.shutdown().await;
}

#[tokio::test]
async fn test_clear_index_wipes_documents() {
    let h = harness(false).await;
    h.set_docs(vec![doc(
        "1",
        "Hello World",
        "The quick brown fox jumps over the lazy dog.",
    )]);
    h.app
        .create_source("mock", json!({"token": "T"}))
        .await
        .unwrap();
    h.quiesce(1).await;

    h.app.clear_index().await.unwrap();

    assert!(search::search_documents(&h.app, "fox", 5).await.unwrap().is_empty());
    assert_eq!(h.app.store.count_documents(None).await.unwrap(), 0);
    assert!(h.app.lexical.is_empty());
    assert!(h.app.vector.is_empty());
    // Sources stay connected after a wipe.
    assert_eq!(h.app.store.load_sources().await.unwrap().len(), 1);
    h.app.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_creates_nothing() {
    let h = harness(false).await;
    let result = h.app.create_source("mock", json!({})).await;
    assert!(matches!(result, Err(ConnectorError::InvalidConfig(_))));
    assert!(h.app.store.load_sources().await.unwrap().is_empty());

    let unknown = h.app.create_source("jira", json!({"token": "T"})).await;
    assert!(matches!(unknown, Err(ConnectorError::Known(_))));
    h.app.shutdown().await;
}
