//! Configuration parsing and validation.
//!
//! docsift is configured via a TOML file (default: `./config/sift.toml`).
//! Every section except `[db]` may be omitted; omitted keys take the
//! defaults listed below.
//!
//! ```toml
//! [db]
//! path = "./data/sift.sqlite"
//!
//! [chunking]
//! max_tokens = 512
//! overlap_tokens = 0
//!
//! [retrieval]
//! vector_top_n = 50
//! lexical_top_n = 50
//! weight_vector = 0.5
//! weight_lexical = 0.3
//! weight_popularity = 0.2
//! default_limit = 10
//! max_limit = 50
//! result_cache_capacity = 1000
//! result_cache_ttl_secs = 86400   # 0 disables the result cache
//!
//! [embedding]
//! provider = "openai"          # disabled | openai | ollama | local
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [storage]
//! root = "./data/uploads"
//! prefix = "docs"
//!
//! [ingest]
//! max_concurrent = 10
//! write_batch_size = 100
//!
//! [writer]
//! capacity = 1000
//! batch_size = 50
//! flush_interval_ms = 2000
//! ```
//!
//! [`load_config`] rejects invalid values up front so later stages can
//! rely on them.

use anyhow::{bail, Context, Result};
use docsift_core::pipeline::IndexerOptions;
use docsift_core::search::{FusionWeights, SearchParams};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub writer: WriterConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: 0,
        }
    }
}

fn default_max_tokens() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_n")]
    pub vector_top_n: i64,
    #[serde(default = "default_top_n")]
    pub lexical_top_n: i64,
    #[serde(default = "default_weight_vector")]
    pub weight_vector: f64,
    #[serde(default = "default_weight_lexical")]
    pub weight_lexical: f64,
    #[serde(default = "default_weight_popularity")]
    pub weight_popularity: f64,
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    #[serde(default = "default_max_limit")]
    pub max_limit: i64,
    #[serde(default = "default_result_cache_capacity")]
    pub result_cache_capacity: u64,
    /// `0` disables the search-result cache.
    #[serde(default = "default_result_cache_ttl_secs")]
    pub result_cache_ttl_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_top_n: default_top_n(),
            lexical_top_n: default_top_n(),
            weight_vector: default_weight_vector(),
            weight_lexical: default_weight_lexical(),
            weight_popularity: default_weight_popularity(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            result_cache_capacity: default_result_cache_capacity(),
            result_cache_ttl_secs: default_result_cache_ttl_secs(),
        }
    }
}

fn default_top_n() -> i64 {
    50
}
fn default_weight_vector() -> f64 {
    0.5
}
fn default_weight_lexical() -> f64 {
    0.3
}
fn default_weight_popularity() -> f64 {
    0.2
}
fn default_limit() -> i64 {
    10
}
fn default_max_limit() -> i64 {
    50
}
fn default_result_cache_capacity() -> u64 {
    1_000
}
fn default_result_cache_ttl_secs() -> u64 {
    86_400
}

impl RetrievalConfig {
    pub fn result_cache_enabled(&self) -> bool {
        self.result_cache_ttl_secs > 0 && self.result_cache_capacity > 0
    }

    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            vector_top_n: self.vector_top_n,
            lexical_top_n: self.lexical_top_n,
            weights: FusionWeights {
                vector: self.weight_vector,
                lexical: self.weight_lexical,
                popularity: self.weight_popularity,
            },
            default_limit: self.default_limit,
            max_limit: self.max_limit,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_batch_size: default_max_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cache_ttl_secs() -> u64 {
    86_400
}
fn default_cache_capacity() -> u64 {
    10_000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default = "default_storage_prefix")]
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            prefix: default_storage_prefix(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/uploads")
}
fn default_storage_prefix() -> String {
    "docs".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            write_batch_size: default_write_batch_size(),
        }
    }
}

fn default_max_concurrent() -> usize {
    10
}
fn default_write_batch_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct WriterConfig {
    #[serde(default = "default_writer_capacity")]
    pub capacity: usize,
    #[serde(default = "default_writer_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            capacity: default_writer_capacity(),
            batch_size: default_writer_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

fn default_writer_capacity() -> usize {
    1000
}
fn default_writer_batch_size() -> usize {
    50
}
fn default_flush_interval_ms() -> u64 {
    2000
}

impl WriterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Config {
    /// A config with every section defaulted and the database at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            storage: StorageConfig::default(),
            ingest: IngestConfig::default(),
            writer: WriterConfig::default(),
        }
    }

    pub fn indexer_options(&self) -> IndexerOptions {
        IndexerOptions {
            max_tokens: self.chunking.max_tokens,
            overlap_tokens: self.chunking.overlap_tokens,
            write_batch_size: self.ingest.write_batch_size,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    // Retrieval
    let r = &config.retrieval;
    if r.vector_top_n < 1 || r.lexical_top_n < 1 {
        bail!("retrieval.vector_top_n and retrieval.lexical_top_n must be >= 1");
    }
    for (name, w) in [
        ("weight_vector", r.weight_vector),
        ("weight_lexical", r.weight_lexical),
        ("weight_popularity", r.weight_popularity),
    ] {
        if !w.is_finite() || w < 0.0 {
            bail!("retrieval.{} must be a non-negative number", name);
        }
    }
    if r.weight_vector + r.weight_lexical + r.weight_popularity > 1.0 + 1e-9 {
        bail!("retrieval weights must sum to at most 1.0");
    }
    if r.default_limit < 1 {
        bail!("retrieval.default_limit must be >= 1");
    }
    if r.max_limit < r.default_limit {
        bail!("retrieval.max_limit must be >= retrieval.default_limit");
    }

    // Embedding
    let e = &config.embedding;
    match e.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if e.is_enabled() && e.provider != "local" {
        if e.dims.is_none() || e.dims == Some(0) {
            bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
        }
        if e.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                e.provider
            );
        }
    }
    if e.max_batch_size == 0 {
        bail!("embedding.max_batch_size must be > 0");
    }

    // Ingest and writer
    if config.ingest.max_concurrent == 0 {
        bail!("ingest.max_concurrent must be >= 1");
    }
    if config.ingest.write_batch_size == 0 {
        bail!("ingest.write_batch_size must be >= 1");
    }
    if config.writer.capacity == 0 || config.writer.batch_size == 0 {
        bail!("writer.capacity and writer.batch_size must be >= 1");
    }

    Ok(())
}
