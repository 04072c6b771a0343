//! Periodic re-index scheduler.
//!
//! A single ticker wakes once per minute and calls `index(force = false)`
//! on every source whose stored `last_indexed_at` is older than one hour.
//! The hour here and the hour-gate inside `SourceHandle::index` are coupled
//! by convention; the gate is what actually protects a source from
//! thrashing when both the ticker and a manual trigger fire.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::registry::SourceRegistry;
use crate::store::Store;

const TICK: Duration = Duration::from_secs(60);
const REINDEX_AFTER: i64 = 60 * 60;

pub fn spawn_scheduler(
    store: Arc<Store>,
    registry: Arc<SourceRegistry>,
    shutdown: &broadcast::Sender<()>,
) -> JoinHandle<()> {
    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        info!("scheduler started");
        let mut ticker = interval(TICK);
        // The immediate first tick; sources crawl on creation, not on boot.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    match run_tick(&store, &registry).await {
                        Ok(0) => debug!("scheduler tick, nothing stale"),
                        Ok(count) => info!(count, "scheduler triggered stale sources"),
                        Err(err) => error!(%err, "scheduler tick failed"),
                    }
                }
            }
        }
        info!("scheduler stopped");
    })
}

/// One pass over all sources: crawl the stale ones. Returns how many
/// `index` calls were made.
pub async fn run_tick(store: &Store, registry: &SourceRegistry) -> Result<usize> {
    let cutoff = (Utc::now() - ChronoDuration::seconds(REINDEX_AFTER)).timestamp();
    let mut triggered = 0;

    for source in store.load_sources().await? {
        if source.last_indexed_at > cutoff {
            continue;
        }
        if let Some(handle) = registry.get_instance(source.id).await {
            handle.index(false).await;
            triggered += 1;
        }
    }
    Ok(triggered)
}

/// Manual trigger: crawl every source immediately, bypassing the gates.
pub async fn trigger_all(registry: &SourceRegistry) {
    for handle in registry.instances().await {
        handle.index(true).await;
    }
}
