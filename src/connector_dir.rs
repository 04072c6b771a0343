//! Local folder connector.
//!
//! Crawls a directory tree of UTF-8 text files. One crawl task is enqueued
//! per top-level subfolder (plus one for files sitting directly in the
//! root), so big trees spread across the worker pool. Files whose
//! modification time predates the source watermark are skipped.
//!
//! # Configuration
//!
//! | field | meaning |
//! |-------|---------|
//! | `path` | root directory to crawl |
//! | `include_globs` | one glob per line; default `**/*.md` and `**/*.txt` |
//! | `exclude_globs` | one glob per line |

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::connector::{required_str, Connector, ConnectorClass, SourceContext};
use crate::error::ConnectorError;
use crate::models::{ConfigField, DocumentKind, DocumentRecord, FieldKind, FileKind, Location};

#[derive(Debug, Clone, Deserialize)]
struct DirConfig {
    path: PathBuf,
    #[serde(default)]
    include_globs: String,
    #[serde(default)]
    exclude_globs: String,
}

impl DirConfig {
    fn parse(config: &Value) -> Result<Self, ConnectorError> {
        serde_json::from_value(config.clone())
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))
    }

    fn include_set(&self) -> Result<GlobSet> {
        let patterns = parse_globs(&self.include_globs);
        if patterns.is_empty() {
            build_globset(&["**/*.md".to_string(), "**/*.txt".to_string()])
        } else {
            build_globset(&patterns)
        }
    }

    fn exclude_set(&self) -> Result<GlobSet> {
        build_globset(&parse_globs(&self.exclude_globs))
    }
}

/// One glob per non-empty line.
fn parse_globs(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("bad glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

pub struct DirClass;

#[async_trait]
impl ConnectorClass for DirClass {
    fn name(&self) -> &'static str {
        "local_folder"
    }

    fn display_name(&self) -> &'static str {
        "Local Folder"
    }

    fn config_fields(&self) -> Vec<ConfigField> {
        vec![
            ConfigField::new("path").with_placeholder("/mnt/shared-docs"),
            ConfigField::new("include_globs")
                .with_kind(FieldKind::Textarea)
                .with_label("Include Globs")
                .with_placeholder("**/*.md"),
            ConfigField::new("exclude_globs")
                .with_kind(FieldKind::Textarea)
                .with_label("Exclude Globs")
                .with_placeholder("**/drafts/**"),
        ]
    }

    async fn validate_config(&self, config: &Value) -> Result<(), ConnectorError> {
        let parsed = DirConfig::parse(config)?;
        if !parsed.path.is_dir() {
            return Err(ConnectorError::InvalidConfig(format!(
                "{} is not a readable directory",
                parsed.path.display()
            )));
        }
        parsed
            .include_set()
            .and(parsed.exclude_set())
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;
        Ok(())
    }

    async fn list_locations(&self, config: &Value) -> Result<Vec<Location>, ConnectorError> {
        let parsed = DirConfig::parse(config)?;
        let mut locations = Vec::new();
        let entries = std::fs::read_dir(&parsed.path)
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                let name = entry.file_name().to_string_lossy().to_string();
                locations.push(Location {
                    value: name.clone(),
                    label: name,
                });
            }
        }
        locations.sort_by(|a, b| a.value.cmp(&b.value));
        Ok(locations)
    }

    fn build(&self, ctx: Arc<SourceContext>) -> Result<Box<dyn Connector>, ConnectorError> {
        let config = DirConfig::parse(&ctx.config)?;
        Ok(Box::new(DirConnector { ctx, config }))
    }
}

pub struct DirConnector {
    ctx: Arc<SourceContext>,
    config: DirConfig,
}

#[async_trait]
impl Connector for DirConnector {
    async fn feed_new_documents(&self) -> Result<(), ConnectorError> {
        info!(root = %self.config.path.display(), "seeding folder crawl");
        // Files directly in the root.
        self.ctx
            .enqueue("scan_folder", json!({ "folder": "" }))
            .await?;

        let entries = std::fs::read_dir(&self.config.path)
            .map_err(|err| ConnectorError::Transient(err.to_string()))?;
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                let name = entry.file_name().to_string_lossy().to_string();
                self.ctx
                    .enqueue("scan_folder", json!({ "folder": name }))
                    .await?;
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        method: &str,
        kwargs: &Map<String, Value>,
    ) -> Result<(), ConnectorError> {
        match method {
            "scan_folder" => self.scan_folder(required_str(kwargs, "folder")?).await,
            other => Err(ConnectorError::UnknownMethod(other.to_string())),
        }
    }
}

impl DirConnector {
    async fn scan_folder(&self, folder: &str) -> Result<(), ConnectorError> {
        let root = self.config.path.join(folder);
        let include = self
            .config
            .include_set()
            .map_err(ConnectorError::Other)?;
        let exclude = self
            .config
            .exclude_set()
            .map_err(ConnectorError::Other)?;

        // The root task only covers files at depth one; subfolders got
        // their own tasks.
        let max_depth = if folder.is_empty() { 1 } else { usize::MAX };

        for entry in WalkDir::new(&root).max_depth(max_depth) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(%err, "skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&self.config.path)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            if exclude.is_match(&relative) || !include.is_match(&relative) {
                continue;
            }

            let modified = file_mtime(entry.path());
            if self.ctx.is_prior_to_last_index(modified) {
                continue;
            }

            match self.read_document(entry.path(), &relative, modified) {
                Ok(Some(doc)) => self.ctx.emit(doc).await?,
                Ok(None) => {}
                Err(err) => {
                    // One unreadable file must not stop the folder crawl.
                    warn!(path = %entry.path().display(), %err, "skipping file");
                }
            }
        }
        Ok(())
    }

    fn read_document(
        &self,
        path: &Path,
        relative: &str,
        modified: DateTime<Utc>,
    ) -> Result<Option<DocumentRecord>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            // Binary or non-UTF-8 content is out of scope for this
            // connector; the document-store parsers live elsewhere.
            Err(_) => return Ok(None),
        };

        let title = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let file_kind = match path.extension().and_then(|e| e.to_str()) {
            Some("txt") => Some(FileKind::Txt),
            _ => None,
        };
        let location = Path::new(relative)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());

        Ok(Some(DocumentRecord {
            source_id: 0,
            external_id: relative.to_string(),
            kind: DocumentKind::Document,
            file_kind,
            title,
            content,
            author: String::new(),
            author_image_url: None,
            location,
            url: format!("file://{}", path.display()),
            timestamp: modified,
            status: None,
            is_active: None,
            children: Vec::new(),
        }))
    }
}

fn file_mtime(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{IndexQueue, TaskQueue};
    use crate::ratelimit::RateLimiter;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn connector_for(
        root: &Path,
        data_dir: &TempDir,
    ) -> (Box<dyn Connector>, Arc<TaskQueue>, Arc<IndexQueue>) {
        let tasks = Arc::new(
            TaskQueue::open(&data_dir.path().join("t.sqlite3"))
                .await
                .unwrap(),
        );
        let index_queue = Arc::new(
            IndexQueue::open(&data_dir.path().join("i.sqlite3"))
                .await
                .unwrap(),
        );
        let ctx = Arc::new(SourceContext::new(
            1,
            json!({ "path": root.to_string_lossy() }),
            0,
            RateLimiter::per_second(100.0),
            tasks.clone(),
            index_queue.clone(),
        ));
        (DirClass.build(ctx).unwrap(), tasks, index_queue)
    }

    #[tokio::test]
    async fn test_validate_rejects_missing_dir() {
        let result = DirClass
            .validate_config(&json!({ "path": "/definitely/not/here" }))
            .await;
        assert!(matches!(result, Err(ConnectorError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_feed_enqueues_task_per_subfolder() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("guides")).unwrap();
        std::fs::create_dir(root.path().join("runbooks")).unwrap();
        std::fs::write(root.path().join("top.md"), "top level").unwrap();

        let data = TempDir::new().unwrap();
        let (connector, tasks, _) = connector_for(root.path(), &data).await;
        connector.feed_new_documents().await.unwrap();

        let mut folders = Vec::new();
        while let Some(leased) = tasks.get(Duration::from_millis(50)).await.unwrap() {
            folders.push(leased.item.kwargs["folder"].as_str().unwrap().to_string());
            tasks.ack(leased.id).await.unwrap();
        }
        folders.sort();
        assert_eq!(folders, vec!["", "guides", "runbooks"]);
    }

    #[tokio::test]
    async fn test_scan_emits_matching_files() {
        let root = TempDir::new().unwrap();
        let guides = root.path().join("guides");
        std::fs::create_dir(&guides).unwrap();
        std::fs::write(guides.join("deploy.md"), "How to deploy the service.").unwrap();
        std::fs::write(guides.join("notes.txt"), "Some notes.").unwrap();
        std::fs::write(guides.join("image.png"), [0u8, 159, 146, 150]).unwrap();

        let data = TempDir::new().unwrap();
        let (connector, _, index_queue) = connector_for(root.path(), &data).await;
        let mut kwargs = Map::new();
        kwargs.insert("folder".to_string(), json!("guides"));
        connector.dispatch("scan_folder", &kwargs).await.unwrap();

        let mut emitted = Vec::new();
        while let Some(leased) = index_queue.get(Duration::from_millis(50)).await.unwrap() {
            emitted.push(leased.item);
            index_queue.ack(leased.id).await.unwrap();
        }
        emitted.sort_by(|a, b| a.external_id.cmp(&b.external_id));

        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].external_id, "guides/deploy.md");
        assert_eq!(emitted[0].location, "guides");
        assert_eq!(emitted[0].source_id, 1);
        assert_eq!(emitted[1].file_kind, Some(FileKind::Txt));
    }

    #[tokio::test]
    async fn test_unknown_method_is_rejected() {
        let root = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let (connector, _, _) = connector_for(root.path(), &data).await;
        let result = connector.dispatch("drop_tables", &Map::new()).await;
        assert!(matches!(result, Err(ConnectorError::UnknownMethod(_))));
    }

    #[tokio::test]
    async fn test_root_scan_ignores_subfolder_files() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("top.md"), "top").unwrap();
        let sub = root.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("nested.md"), "nested").unwrap();

        let data = TempDir::new().unwrap();
        let (connector, _, index_queue) = connector_for(root.path(), &data).await;
        let mut kwargs = Map::new();
        kwargs.insert("folder".to_string(), json!(""));
        connector.dispatch("scan_folder", &kwargs).await.unwrap();

        let leased = index_queue
            .get(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.item.external_id, "top.md");
        assert!(index_queue
            .get(Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());
    }
}
