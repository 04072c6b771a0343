//! Configuration parsing and validation.
//!
//! hivesearch is configured via a TOML file (default:
//! `./config/hivesearch.toml`). Every tunable has a serde default, so an
//! empty file — or no file at all — yields a working configuration. The
//! config defines the data directory layout, worker pool size, indexer
//! batching, chunking thresholds, recall candidate counts, the inference
//! endpoint, and the HTTP bind address.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Directory holding the store, both queue files, both index blobs,
    /// and the install id.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory of `{type_name}.png` icons served inline by the HTTP API.
    #[serde(default = "default_icons_dir")]
    pub icons_dir: PathBuf,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub models: ModelsConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_icons_dir() -> PathBuf {
    PathBuf::from("./static/data_source_icons")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8077".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Number of crawl workers pulling from the task queue.
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// How long a worker blocks on an empty task queue before re-checking
    /// the shutdown signal.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

fn default_worker_count() -> usize {
    20
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    /// Maximum documents drained from the index queue per batch.
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
    /// How long the indexer blocks waiting for the first queued document.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_max: default_batch_max(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_batch_max() -> usize {
    5000
}

fn default_drain_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Paragraphs are merged until a chunk reaches this length.
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    /// Hard cap on chunk length; matches the store's content column budget.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            max_chars: default_max_chars(),
        }
    }
}

fn default_min_chars() -> usize {
    256
}

fn default_max_chars() -> usize {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Candidates recalled from the vector index. Raise (60) when the
    /// inference endpoint is GPU-backed.
    #[serde(default = "default_dense_candidates")]
    pub dense_candidates: usize,
    /// Candidates recalled from the lexical index. Raise (100) on GPU.
    #[serde(default = "default_lexical_candidates")]
    pub lexical_candidates: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            dense_candidates: default_dense_candidates(),
            lexical_candidates: default_lexical_candidates(),
        }
    }
}

fn default_dense_candidates() -> usize {
    20
}

fn default_lexical_candidates() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    /// Base URL of the inference sidecar exposing /encode, /score, /answer.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Embedding dimensionality of the bi-encoder behind the endpoint.
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_model_retries")]
    pub max_retries: u32,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            dims: default_dims(),
            timeout_secs: default_model_timeout_secs(),
            max_retries: default_model_retries(),
        }
    }
}

fn default_dims() -> usize {
    384
}

fn default_model_timeout_secs() -> u64 {
    30
}

fn default_model_retries() -> u32 {
    5
}

impl AppConfig {
    /// Load configuration from a TOML file. A missing file is not an error;
    /// it yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::with_defaults());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults without touching the filesystem.
    pub fn with_defaults() -> Self {
        Self {
            data_dir: default_data_dir(),
            icons_dir: default_icons_dir(),
            server: ServerConfig::default(),
            workers: WorkerConfig::default(),
            indexer: IndexerConfig::default(),
            chunking: ChunkingConfig::default(),
            search: SearchConfig::default(),
            models: ModelsConfig::default(),
        }
    }

    /// Defaults rooted at the given data directory. Used by tests and
    /// embedded setups.
    pub fn for_data_dir(data_dir: &Path) -> Self {
        let mut config = Self::with_defaults();
        config.data_dir = data_dir.to_path_buf();
        config
    }

    fn validate(&self) -> Result<()> {
        if self.workers.count == 0 {
            anyhow::bail!("workers.count must be at least 1");
        }
        if self.chunking.min_chars == 0 || self.chunking.min_chars >= self.chunking.max_chars {
            anyhow::bail!("chunking.min_chars must be in 1..chunking.max_chars");
        }
        if self.indexer.batch_max == 0 {
            anyhow::bail!("indexer.batch_max must be at least 1");
        }
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("db.sqlite3")
    }

    pub fn task_queue_path(&self) -> PathBuf {
        self.data_dir.join("tasks.sqlite3")
    }

    pub fn index_queue_path(&self) -> PathBuf {
        self.data_dir.join("indexing.sqlite3")
    }

    pub fn lexical_index_path(&self) -> PathBuf {
        self.data_dir.join("bm25_index.bin")
    }

    pub fn vector_index_path(&self) -> PathBuf {
        self.data_dir.join("vector_index.bin")
    }

    pub fn install_id_path(&self) -> PathBuf {
        self.data_dir.join(".uuid")
    }
}
