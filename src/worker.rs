//! Crawl worker pool.
//!
//! A fixed pool of interchangeable workers, each looping: lease a task,
//! resolve the connector instance, dispatch the named method, ack. Any
//! worker can service any source; per-source politeness comes from the
//! connector's token bucket, not from worker affinity — which also means
//! nothing orders tasks within a source.
//!
//! Failure policy: a task that errors has its attempt counter decremented
//! and is nacked for re-delivery while attempts remain; after exhaustion it
//! is dead-lettered and the crawl moves on. A task whose source has been
//! deleted mid-flight is dropped the same way. One bad task never stops a
//! worker.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::models::TaskItem;
use crate::queue::{Leased, TaskQueue};
use crate::registry::SourceRegistry;

/// Spawn the pool. Handles are returned so shutdown can be awaited.
pub fn spawn_workers(
    config: &WorkerConfig,
    tasks: Arc<TaskQueue>,
    registry: Arc<SourceRegistry>,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    (0..config.count)
        .map(|worker_id| {
            let tasks = tasks.clone();
            let registry = registry.clone();
            let mut shutdown_rx = shutdown.subscribe();
            let poll_timeout = Duration::from_millis(config.poll_timeout_ms);
            tokio::spawn(async move {
                debug!(worker_id, "worker started");
                loop {
                    let leased = tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        leased = tasks.get(poll_timeout) => leased,
                    };

                    match leased {
                        Ok(Some(leased)) => handle_task(&tasks, &registry, leased).await,
                        Ok(None) => continue,
                        Err(err) => {
                            error!(worker_id, %err, "task queue read failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                debug!(worker_id, "worker stopped");
            })
        })
        .collect()
}

async fn handle_task(tasks: &TaskQueue, registry: &SourceRegistry, leased: Leased<TaskItem>) {
    let Leased { id, mut item } = leased;

    let Some(handle) = registry.get_instance(item.source_id).await else {
        // The source was deleted while its tasks were queued.
        warn!(source_id = item.source_id, method = %item.method,
              "dropping task for unknown source");
        finish(tasks.ack_failed(id).await);
        return;
    };

    match handle.run_task(&item.method, &item.kwargs).await {
        Ok(()) => finish(tasks.ack(id).await),
        Err(err) => {
            let remaining = item.attempts_remaining.saturating_sub(1);
            if remaining > 0 {
                warn!(source_id = item.source_id, method = %item.method, %err,
                      remaining, "task failed, re-queueing");
                item.attempts_remaining = remaining;
                finish(tasks.update(id, &item).await);
                finish(tasks.nack(id).await);
            } else {
                error!(source_id = item.source_id, method = %item.method, %err,
                       "task failed permanently, dead-lettering");
                handle.record_failed_task();
                finish(tasks.ack_failed(id).await);
            }
        }
    }
}

fn finish(result: anyhow::Result<()>) {
    if let Err(err) = result {
        error!(%err, "task queue bookkeeping failed");
    }
}

/// Signal shutdown and wait for every worker to finish its current task.
pub async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            error!(%err, "worker task panicked");
        }
    }
    info!("workers stopped");
}
