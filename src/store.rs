//! SQLite metadata store for source types, sources, documents, and chunks.
//!
//! Single-writer store accessed through short-lived transactions. Ownership
//! cascades are declared in the schema (`ON DELETE CASCADE` from source to
//! document to chunk, and from parent document to children); the indexes
//! hold chunk ids only, so deleting a source hands the doomed chunk ids to
//! a removal hook inside the same transaction — store state and index state
//! cannot diverge.
//!
//! Enforced invariants:
//! - `(source_id, external_id)` is unique per document.
//! - Deleting a document removes its chunks and child documents.
//! - Deleting a source removes everything it owns.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;

use crate::chunker::split_text;
use crate::config::ChunkingConfig;
use crate::lexical::LexicalEntry;
use crate::models::{ConfigField, DocumentKind, DocumentRecord, FileKind};

/// A registered connector kind.
#[derive(Debug, Clone)]
pub struct SourceType {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub config_fields: Vec<ConfigField>,
}

/// A configured connector instance loaded with its type.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub id: i64,
    pub type_name: String,
    pub config: Value,
    pub created_at: i64,
    /// Unix seconds; 0 means never indexed.
    pub last_indexed_at: i64,
}

/// A stored document row.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: i64,
    pub source_id: i64,
    pub external_id: String,
    pub parent_id: Option<i64>,
    pub kind: DocumentKind,
    pub file_kind: Option<FileKind>,
    pub title: String,
    pub author: String,
    pub author_image_url: Option<String>,
    pub location: String,
    pub url: String,
    pub timestamp: i64,
    pub status: Option<String>,
    pub is_active: Option<bool>,
}

/// A chunk joined with its document and the owning source's type name.
#[derive(Debug, Clone)]
pub struct ChunkWithDocument {
    pub chunk_id: i64,
    pub content: String,
    pub document: Document,
    pub source_type: String,
}

/// A chunk row created by [`Store::insert_document_trees`], carrying what
/// the indexer needs to build index entries.
#[derive(Debug, Clone)]
pub struct InsertedChunk {
    pub id: i64,
    pub content: String,
    pub title: String,
}

/// Invoked with the chunk ids doomed by a source deletion, inside the
/// deleting transaction.
pub trait ChunkRemovalHook: Send + Sync {
    fn remove_chunks(&self, chunk_ids: &[i64]) -> Result<()>;
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the store and run the idempotent schema migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open store {}", path.display()))?;

        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    // ============ Source types ============

    /// Insert or refresh a connector kind. Called once per discovered
    /// connector class at startup; rows are never deleted.
    pub async fn upsert_source_type(
        &self,
        name: &str,
        display_name: &str,
        config_fields: &[ConfigField],
    ) -> Result<i64> {
        let fields_json = serde_json::to_string(config_fields)?;
        sqlx::query(
            r#"
            INSERT INTO source_types (name, display_name, config_fields) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                display_name = excluded.display_name,
                config_fields = excluded.config_fields
            "#,
        )
        .bind(name)
        .bind(display_name)
        .bind(fields_json)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM source_types WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn source_type_by_name(&self, name: &str) -> Result<Option<SourceType>> {
        let row = sqlx::query(
            "SELECT id, name, display_name, config_fields FROM source_types WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(source_type_from_row).transpose()
    }

    pub async fn list_source_types(&self) -> Result<Vec<SourceType>> {
        let rows = sqlx::query(
            "SELECT id, name, display_name, config_fields FROM source_types ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(source_type_from_row).collect()
    }

    // ============ Sources ============

    pub async fn insert_source(&self, type_id: i64, config: &Value) -> Result<i64> {
        let config_json = serde_json::to_string(config)?;
        let result = sqlx::query(
            "INSERT INTO sources (type_id, config, created_at, last_indexed_at) VALUES (?, ?, ?, 0)",
        )
        .bind(type_id)
        .bind(config_json)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Load every source with its type name, eagerly.
    pub async fn load_sources(&self) -> Result<Vec<LoadedSource>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.config, s.created_at, s.last_indexed_at, st.name AS type_name
            FROM sources s
            JOIN source_types st ON st.id = s.type_id
            ORDER BY s.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut sources = Vec::with_capacity(rows.len());
        for row in rows {
            let config_json: String = row.get("config");
            sources.push(LoadedSource {
                id: row.get("id"),
                type_name: row.get("type_name"),
                config: serde_json::from_str(&config_json)
                    .context("corrupt source config blob")?,
                created_at: row.get("created_at"),
                last_indexed_at: row.get("last_indexed_at"),
            });
        }
        Ok(sources)
    }

    pub async fn source_exists(&self, source_id: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn touch_last_indexed(&self, source_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sources SET last_indexed_at = ? WHERE id = ?")
            .bind(at.timestamp())
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a source and everything it owns. The doomed chunk ids are
    /// handed to `hook` before the transaction commits.
    pub async fn delete_source(&self, source_id: i64, hook: &dyn ChunkRemovalHook) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let chunk_ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT c.id FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.source_id = ?
            "#,
        )
        .bind(source_id)
        .fetch_all(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            anyhow::bail!("source {} does not exist", source_id);
        }

        hook.remove_chunks(&chunk_ids)?;
        tx.commit().await?;
        Ok(())
    }

    // ============ Documents and chunks ============

    /// Find documents by `(source_id, external_id)` over a set of ids.
    pub async fn find_documents(
        &self,
        source_id: i64,
        external_ids: &[String],
    ) -> Result<Vec<Document>> {
        let mut found = Vec::new();
        for external_id in external_ids {
            let row = sqlx::query(&format!(
                "SELECT {} FROM documents d WHERE d.source_id = ? AND d.external_id = ?",
                DOCUMENT_COLUMNS
            ))
            .bind(source_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                found.push(document_from_row(&row)?);
            }
        }
        Ok(found)
    }

    /// Remove any stored documents matching the given `(source_id,
    /// external_id)` keys, in one transaction. Returns the chunk ids that
    /// went away with them (own chunks plus child documents' chunks).
    pub async fn remove_documents_matching(&self, keys: &[(i64, String)]) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut removed_chunks = Vec::new();

        for (source_id, external_id) in keys {
            let doc_id: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM documents WHERE source_id = ? AND external_id = ?",
            )
            .bind(source_id)
            .bind(external_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(doc_id) = doc_id {
                removed_chunks.extend(delete_document_tx(&mut tx, doc_id).await?);
            }
        }

        tx.commit().await?;
        Ok(removed_chunks)
    }

    /// Delete one document (cascading to chunks and children), returning
    /// the removed chunk ids.
    pub async fn delete_document(&self, doc_id: i64) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let chunk_ids = delete_document_tx(&mut tx, doc_id).await?;
        tx.commit().await?;
        Ok(chunk_ids)
    }

    /// Insert a batch of document trees (document + chunks + children with
    /// their chunks) in one transaction. Content is split per `chunking`.
    pub async fn insert_document_trees(
        &self,
        docs: &[DocumentRecord],
        chunking: &ChunkingConfig,
    ) -> Result<Vec<InsertedChunk>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::new();

        for doc in docs {
            let doc_id = insert_document_tx(&mut tx, doc, None).await?;
            insert_chunks_tx(&mut tx, doc_id, doc, chunking, &mut inserted).await?;

            for child in &doc.children {
                let child_id = insert_document_tx(&mut tx, child, Some(doc_id)).await?;
                insert_chunks_tx(&mut tx, child_id, child, chunking, &mut inserted).await?;
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn document_by_id(&self, doc_id: i64) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents d WHERE d.id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    /// Fetch chunks joined with their documents and source type name, by
    /// chunk id set. Unknown ids are silently skipped (the indexes may be a
    /// cycle ahead of a deletion).
    pub async fn chunks_with_documents(&self, chunk_ids: &[i64]) -> Result<Vec<ChunkWithDocument>> {
        let mut result = Vec::with_capacity(chunk_ids.len());
        for chunk_id in chunk_ids {
            let row = sqlx::query(&format!(
                r#"
                SELECT c.id AS chunk_id, c.content AS chunk_content, st.name AS type_name, {}
                FROM chunks c
                JOIN documents d ON d.id = c.document_id
                JOIN sources s ON s.id = d.source_id
                JOIN source_types st ON st.id = s.type_id
                WHERE c.id = ?
                "#,
                DOCUMENT_COLUMNS
            ))
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                result.push(ChunkWithDocument {
                    chunk_id: row.get("chunk_id"),
                    content: row.get("chunk_content"),
                    source_type: row.get("type_name"),
                    document: document_from_row(&row)?,
                });
            }
        }
        Ok(result)
    }

    /// Everything the lexical index needs for a full rebuild.
    pub async fn lexical_entries(&self) -> Result<Vec<LexicalEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id AS chunk_id, c.content, d.title, d.author, st.name AS type_name
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            JOIN sources s ON s.id = d.source_id
            JOIN source_types st ON st.id = s.type_id
            ORDER BY c.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LexicalEntry {
                chunk_id: row.get("chunk_id"),
                content: row.get("content"),
                title: row.get("title"),
                author: row.get("author"),
                source_type: row.get("type_name"),
            })
            .collect())
    }

    pub async fn count_documents(&self, source_id: Option<i64>) -> Result<u64> {
        let count: i64 = match source_id {
            Some(id) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE source_id = ?")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM documents")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as u64)
    }

    pub async fn count_chunks(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Wipe all documents and chunks (sources stay connected).
    pub async fn clear_documents(&self) -> Result<()> {
        sqlx::query("DELETE FROM documents")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

const DOCUMENT_COLUMNS: &str = "d.id, d.source_id, d.external_id, d.parent_id, d.kind, \
     d.file_kind, d.title, d.author, d.author_image_url, d.location, d.url, \
     d.timestamp, d.status, d.is_active";

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_types (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            config_fields TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type_id INTEGER NOT NULL REFERENCES source_types(id),
            config TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_indexed_at INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            external_id TEXT NOT NULL,
            parent_id INTEGER REFERENCES documents(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            file_kind TEXT,
            title TEXT NOT NULL DEFAULT '',
            author TEXT NOT NULL DEFAULT '',
            author_image_url TEXT,
            location TEXT NOT NULL DEFAULT '',
            url TEXT NOT NULL DEFAULT '',
            timestamp INTEGER NOT NULL,
            status TEXT,
            is_active INTEGER,
            UNIQUE(source_id, external_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            content TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_parent ON documents(parent_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
        .execute(pool)
        .await?;

    Ok(())
}

fn source_type_from_row(row: sqlx::sqlite::SqliteRow) -> Result<SourceType> {
    let fields_json: String = row.get("config_fields");
    Ok(SourceType {
        id: row.get("id"),
        name: row.get("name"),
        display_name: row.get("display_name"),
        config_fields: serde_json::from_str(&fields_json)
            .context("corrupt source type schema")?,
    })
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let kind: String = row.get("kind");
    let file_kind: Option<String> = row.get("file_kind");
    Ok(Document {
        id: row.get("id"),
        source_id: row.get("source_id"),
        external_id: row.get("external_id"),
        parent_id: row.get("parent_id"),
        kind: DocumentKind::parse(&kind)
            .ok_or_else(|| anyhow::anyhow!("unknown document kind: {}", kind))?,
        file_kind: file_kind.as_deref().and_then(FileKind::parse),
        title: row.get("title"),
        author: row.get("author"),
        author_image_url: row.get("author_image_url"),
        location: row.get("location"),
        url: row.get("url"),
        timestamp: row.get("timestamp"),
        status: row.get("status"),
        is_active: row.get("is_active"),
    })
}

async fn delete_document_tx(tx: &mut Transaction<'_, Sqlite>, doc_id: i64) -> Result<Vec<i64>> {
    let chunk_ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT c.id FROM chunks c
        JOIN documents d ON d.id = c.document_id
        WHERE d.id = ? OR d.parent_id = ?
        "#,
    )
    .bind(doc_id)
    .bind(doc_id)
    .fetch_all(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await?;

    Ok(chunk_ids)
}

async fn insert_document_tx(
    tx: &mut Transaction<'_, Sqlite>,
    doc: &DocumentRecord,
    parent_id: Option<i64>,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO documents
            (source_id, external_id, parent_id, kind, file_kind, title, author,
             author_image_url, location, url, timestamp, status, is_active)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(doc.source_id)
    .bind(&doc.external_id)
    .bind(parent_id)
    .bind(doc.kind.as_str())
    .bind(doc.file_kind.map(|k| k.as_str()))
    .bind(&doc.title)
    .bind(&doc.author)
    .bind(&doc.author_image_url)
    .bind(&doc.location)
    .bind(&doc.url)
    .bind(doc.timestamp.timestamp())
    .bind(&doc.status)
    .bind(doc.is_active)
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn insert_chunks_tx(
    tx: &mut Transaction<'_, Sqlite>,
    doc_id: i64,
    doc: &DocumentRecord,
    chunking: &ChunkingConfig,
    inserted: &mut Vec<InsertedChunk>,
) -> Result<()> {
    for content in split_text(&doc.content, chunking.min_chars, chunking.max_chars) {
        let result = sqlx::query("INSERT INTO chunks (document_id, content) VALUES (?, ?)")
            .bind(doc_id)
            .bind(&content)
            .execute(&mut **tx)
            .await?;
        inserted.push(InsertedChunk {
            id: result.last_insert_rowid(),
            content,
            title: doc.title.clone(),
        });
    }
    Ok(())
}
