//! Index configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::chunker::{TextChunker, DEFAULT_SEPARATORS};
use super::error::{IndexError, IndexResult};
use super::types::DistanceMetric;
use super::vector_store::validate_collection_name;

/// Main index configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Collection location and metric
    #[serde(default)]
    pub store: StoreConfig,

    /// Chunking parameters
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Embedding API configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

/// Where and how the collection is stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding collections
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,

    /// Collection name (one sub-directory of `persist_dir`)
    #[serde(default = "default_collection_name")]
    pub collection_name: String,

    /// Similarity metric, used only when the collection is created
    #[serde(default)]
    pub metric: DistanceMetric,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            persist_dir: None,
            collection_name: default_collection_name(),
            metric: DistanceMetric::default(),
        }
    }
}

impl StoreConfig {
    /// Get persist directory, using default if not specified
    pub fn persist_dir(&self) -> PathBuf {
        if let Some(ref path) = self.persist_dir {
            return path.clone();
        }

        IndexConfig::config_dir().join("collections")
    }
}

fn default_collection_name() -> String {
    "rag_collection".to_string()
}

/// Chunking configuration, sizes in characters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Coarsest to finest; `""` means character-level
    #[serde(default = "default_separators")]
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            separators: default_separators(),
        }
    }
}

impl ChunkingConfig {
    pub fn build_chunker(&self) -> IndexResult<TextChunker> {
        TextChunker::new(self.chunk_size, self.chunk_overlap)?
            .with_separators(self.separators.clone())
    }
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_separators() -> Vec<String> {
    DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect()
}

/// Embedding API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// API key (can also use EMBEDDING_API_KEY / OPENAI_API_KEY env var)
    #[serde(default)]
    pub api_key: Option<String>,

    /// API base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Model name
    #[serde(default = "default_model")]
    pub model: String,

    /// Embedding dimensions
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Batch size for embedding requests
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-call timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts after the first one for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between attempts, doubled on every retry
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: default_api_base(),
            model: default_model(),
            dimensions: default_dimensions(),
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl EmbeddingConfig {
    /// Get API key from config or environment
    pub fn get_api_key(&self) -> IndexResult<String> {
        if let Some(ref key) = self.api_key {
            if !key.is_empty() {
                return Ok(key.clone());
            }
        }

        std::env::var("EMBEDDING_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| IndexError::Configuration("embedding API key is missing".to_string()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dimensions() -> usize {
    // text-embedding-3-small: 1536, text-embedding-3-large: 3072
    1536
}

fn default_batch_size() -> usize {
    64
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

/// Bounded retry schedule for embedding calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&EmbeddingConfig::default())
    }
}

impl From<&EmbeddingConfig> for RetryPolicy {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_backoff_ms),
            timeout: config.timeout(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

impl IndexConfig {
    /// Load configuration from file and environment
    /// Priority: environment variables > config.toml > defaults
    pub fn load() -> IndexResult<Self> {
        let mut config = Self::default();

        let toml_path = Self::toml_config_path();
        if toml_path.exists() {
            let content = std::fs::read_to_string(&toml_path)?;
            config = toml::from_str::<IndexConfig>(&content).map_err(|e| {
                IndexError::Configuration(format!("invalid {}: {}", toml_path.display(), e))
            })?;
        }

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> IndexResult<()> {
        if let Ok(dir) = std::env::var("RAGSTORE_PERSIST_DIR") {
            self.store.persist_dir = Some(PathBuf::from(dir));
        }
        if let Ok(name) = std::env::var("RAGSTORE_COLLECTION") {
            self.store.collection_name = name;
        }
        if let Some(size) = env_usize("RAGSTORE_CHUNK_SIZE")? {
            self.chunking.chunk_size = size;
        }
        if let Some(overlap) = env_usize("RAGSTORE_CHUNK_OVERLAP")? {
            self.chunking.chunk_overlap = overlap;
        }

        // New naming takes precedence over legacy naming
        if let Ok(api_base) =
            std::env::var("EMBEDDING_API_BASE").or_else(|_| std::env::var("OPENAI_API_BASE"))
        {
            self.embedding.api_base = api_base;
        }
        if let Ok(api_key) =
            std::env::var("EMBEDDING_API_KEY").or_else(|_| std::env::var("OPENAI_API_KEY"))
        {
            self.embedding.api_key = Some(api_key);
        }
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            self.embedding.model = model;
        }

        Ok(())
    }

    /// Check chunking and collection parameters
    pub fn validate(&self) -> IndexResult<()> {
        self.chunking.build_chunker()?;

        validate_collection_name(&self.store.collection_name)?;
        if self.embedding.dimensions == 0 {
            return Err(IndexError::Configuration(
                "embedding dimensions must be greater than 0".to_string(),
            ));
        }
        if self.embedding.batch_size == 0 {
            return Err(IndexError::Configuration(
                "embedding batch_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get base config directory
    pub fn config_dir() -> PathBuf {
        if let Ok(root) = std::env::var("RAGSTORE_ROOT") {
            return PathBuf::from(root);
        }

        dirs::home_dir()
            .map(|h| h.join(".ragstore"))
            .unwrap_or_else(|| PathBuf::from(".ragstore"))
    }

    /// Get config file path (config.toml)
    pub fn toml_config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

fn env_usize(key: &str) -> IndexResult<Option<usize>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| IndexError::Configuration(format!("{key} must be an integer, got '{value}'"))),
        Err(_) => Ok(None),
    }
}
