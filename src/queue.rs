//! Durable work queues with ack/nack semantics.
//!
//! Both queues (crawl tasks and documents awaiting indexing) are instances
//! of the same generic [`AckQueue`], each backed by its own SQLite file so
//! queued work survives restarts. Delivery is at-least-once: an item is
//! leased by `get`/`drain` and only leaves the queue on `ack`. Items leased
//! by a process that died are returned to the ready state the next time the
//! queue file is opened ("unack recovery").
//!
//! | call | effect |
//! |------|--------|
//! | `put` | insert as ready, wake one waiter |
//! | `get(timeout)` | lease the oldest ready item, or `None` on timeout |
//! | `drain(max_n, timeout)` | wait for the first ready item, lease up to `max_n` |
//! | `ack` | delete the leased item |
//! | `nack` | return the leased item to ready for re-delivery |
//! | `update` | rewrite a leased item's payload (attempt counters) |
//! | `ack_failed` | move the leased item to the dead-letter state |
//!
//! Ordering is approximate FIFO by rowid; concurrent producers get no
//! stronger guarantee.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::models::{DocumentRecord, TaskItem};

/// Queue of crawl-step tasks consumed by the worker pool.
pub type TaskQueue = AckQueue<TaskItem>;

/// Queue of normalized documents consumed by the indexer.
pub type IndexQueue = AckQueue<DocumentRecord>;

const STATE_READY: i64 = 0;
const STATE_LEASED: i64 = 1;
const STATE_DEAD: i64 = 2;

/// An item handed out by `get`/`drain`; `id` is the lease handle to pass
/// back to `ack`/`nack`/`update`/`ack_failed`.
#[derive(Debug)]
pub struct Leased<T> {
    pub id: i64,
    pub item: T,
}

/// A persistent at-least-once queue over one SQLite file.
pub struct AckQueue<T> {
    pool: SqlitePool,
    notify: Notify,
    _payload: PhantomData<fn() -> T>,
}

impl<T> AckQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// Open (or create) the queue file and recover leased items left behind
    /// by a previous process.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open queue file {}", path.display()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                state INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_state ON queue(state, id)")
            .execute(&pool)
            .await?;

        // Unack recovery: everything leased by a dead process is ready again.
        let recovered = sqlx::query("UPDATE queue SET state = ? WHERE state = ?")
            .bind(STATE_READY)
            .bind(STATE_LEASED)
            .execute(&pool)
            .await?
            .rows_affected();
        if recovered > 0 {
            tracing::info!(recovered, path = %path.display(), "recovered in-flight queue items");
        }

        Ok(Self {
            pool,
            notify: Notify::new(),
            _payload: PhantomData,
        })
    }

    /// Insert an item in the ready state.
    pub async fn put(&self, item: &T) -> Result<()> {
        let payload = serde_json::to_string(item)?;
        sqlx::query("INSERT INTO queue (payload, state, enqueued_at) VALUES (?, ?, ?)")
            .bind(payload)
            .bind(STATE_READY)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        self.notify.notify_one();
        Ok(())
    }

    /// Lease the oldest ready item, waiting up to `timeout` for one to
    /// appear.
    pub async fn get(&self, timeout: Duration) -> Result<Option<Leased<T>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut leased = self.lease_batch(1).await?;
            if let Some(item) = leased.pop() {
                return Ok(Some(item));
            }
            if !self.wait_until(deadline).await {
                return Ok(None);
            }
        }
    }

    /// Wait up to `timeout` for the queue to become non-empty, then lease up
    /// to `max_n` currently-ready items at once.
    pub async fn drain(&self, max_n: usize, timeout: Duration) -> Result<Vec<Leased<T>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let leased = self.lease_batch(max_n).await?;
            if !leased.is_empty() {
                return Ok(leased);
            }
            if !self.wait_until(deadline).await {
                return Ok(Vec::new());
            }
        }
    }

    /// Delete a leased item; the work is done.
    pub async fn ack(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Return a leased item to the ready state for re-delivery.
    pub async fn nack(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE queue SET state = ? WHERE id = ?")
            .bind(STATE_READY)
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.notify.notify_one();
        Ok(())
    }

    /// Rewrite a leased item's payload (attempt-counter decrement).
    pub async fn update(&self, id: i64, item: &T) -> Result<()> {
        let payload = serde_json::to_string(item)?;
        sqlx::query("UPDATE queue SET payload = ? WHERE id = ?")
            .bind(payload)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop a leased item into the dead-letter state. Dead rows are kept in
    /// the file for inspection but never delivered again.
    pub async fn ack_failed(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE queue SET state = ? WHERE id = ?")
            .bind(STATE_DEAD)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of live (ready or leased) items.
    pub async fn len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue WHERE state != ?")
            .bind(STATE_DEAD)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Number of dead-lettered items.
    pub async fn dead_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue WHERE state = ?")
            .bind(STATE_DEAD)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn lease_batch(&self, max_n: usize) -> Result<Vec<Leased<T>>> {
        let rows = sqlx::query(
            r#"
            UPDATE queue SET state = ?
            WHERE id IN (SELECT id FROM queue WHERE state = ? ORDER BY id LIMIT ?)
            RETURNING id, payload
            "#,
        )
        .bind(STATE_LEASED)
        .bind(STATE_READY)
        .bind(max_n as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut leased = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let payload: String = row.get("payload");
            match serde_json::from_str(&payload) {
                Ok(item) => leased.push(Leased { id, item }),
                Err(err) => {
                    // A payload this process cannot decode would loop
                    // forever; dead-letter it.
                    tracing::error!(id, %err, "undecodable queue payload, moving to dead letter");
                    self.ack_failed(id).await?;
                }
            }
        }
        Ok(leased)
    }

    /// Returns false once the deadline has passed.
    async fn wait_until(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        true
    }
}
