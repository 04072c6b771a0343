//! Install id and usage counters.
//!
//! The install id is a random UUID persisted as `.uuid` in the data
//! directory, stable across restarts, used to tag telemetry without
//! identifying anyone. Counters are plain atomics; whatever ships them
//! somewhere is someone else's problem.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Load the stable install id, creating it on first run.
pub fn load_or_create_install_id(path: &Path) -> Result<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let id = Uuid::new_v4().to_string();
    std::fs::write(path, &id)
        .with_context(|| format!("failed to write install id to {}", path.display()))?;
    Ok(id)
}

/// Process-wide usage counters.
#[derive(Debug, Default)]
pub struct Counters {
    searches: AtomicU64,
    sources_created: AtomicU64,
}

impl Counters {
    pub fn record_search(&self) {
        self.searches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_created(&self) {
        self.sources_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn searches(&self) -> u64 {
        self.searches.load(Ordering::Relaxed)
    }

    pub fn sources_created(&self) -> u64 {
        self.sources_created.load(Ordering::Relaxed)
    }
}
