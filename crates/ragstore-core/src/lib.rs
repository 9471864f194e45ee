//! RagStore Core
//!
//! Document chunking and a persistent vector index for retrieval-augmented
//! generation.
//!
//! ## Features
//!
//! - Recursive character splitting with overlap and chunk lineage metadata
//! - Deterministic chunk ids, so re-ingesting a document is idempotent
//! - SQLite-backed collections with buffered writes and explicit persist
//! - Cosine / L2 top-k search with exact-match metadata filters
//! - OpenAI-compatible embedding client (`openai` feature)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ragstore_core::{DocumentRecord, IndexConfig, IndexManager, OpenAiEmbedder};
//! use std::sync::Arc;
//!
//! let config = IndexConfig::load()?;
//! let embedder = Arc::new(OpenAiEmbedder::new(config.embedding.clone())?);
//! let manager = IndexManager::open(&config, embedder)?;
//!
//! manager
//!     .add_documents(vec![DocumentRecord::new(text).with_metadata("source", "notes.md")])
//!     .await?;
//! let hits = manager.search("how do I rotate keys", 5, None).await?;
//! ```

mod chunker;
mod config;
mod embedding;
mod error;
mod events;
mod indexer;
mod sources;
mod types;
mod vector_store;


use chrono::{SecondsFormat, Utc};

pub use chunker::{TextChunker, TextSpan, DEFAULT_SEPARATORS};
pub use config::{ChunkingConfig, EmbeddingConfig, IndexConfig, RetryPolicy, StoreConfig};
pub use embedding::Embedder;
#[cfg(feature = "openai")]
pub use embedding::OpenAiEmbedder;
pub use error::{ErrorKind, IndexError, IndexResult};
pub use events::{EventBus, IndexEvent, IndexEventKind, IndexObserver, LogObserver, SharedObserver};
pub use indexer::{AddReport, IndexManager, IndexProgress, RecordOutcome, RecordStatus};
pub use sources::{DocumentSource, SourceSummary, TextEncoding, TextFileSource};
pub use types::*;
pub use vector_store::{
    validate_collection_name, AddResult, CollectionInfo, MemoryBackend, PersistResult,
    SqliteBackend, StorageBackend, StoredCollection, VectorIndex, DB_FILE_NAME, SCHEMA_VERSION,
};

pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
