//! Error types for indexing and retrieval

use std::time::Duration;

use thiserror::Error;

/// Broad error category, used by callers to decide whether to fix config,
/// skip a record, retry, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad chunking parameters or embedding dimensionality. Not retried.
    Configuration,
    /// A single malformed input record. The batch can continue.
    Validation,
    /// I/O, corruption or lock contention in the collection store.
    Storage,
    /// The embedding capability failed or timed out.
    Embedding,
    /// Bad argument to a query operation.
    InvalidArgument,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("collection corrupted: {0}")]
    Corrupted(String),

    #[error("collection is locked: {0}")]
    LockContention(String),

    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("embedding timed out after {0:?}")]
    EmbeddingTimeout(Duration),

    #[cfg(feature = "openai")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type IndexResult<T> = Result<T, IndexError>;

impl IndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::DimensionMismatch { .. } => ErrorKind::Configuration,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Storage(_)
            | Self::Corrupted(_)
            | Self::LockContention(_)
            | Self::Sqlite(_)
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Storage,
            Self::Embedding(_) | Self::EmbeddingUnavailable(_) | Self::EmbeddingTimeout(_) => {
                ErrorKind::Embedding
            }
            #[cfg(feature = "openai")]
            Self::Http(_) => ErrorKind::Embedding,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::LockContention(_) | Self::EmbeddingUnavailable(_) | Self::EmbeddingTimeout(_) => {
                true
            }
            #[cfg(feature = "openai")]
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Whether the whole batch must stop (nothing else can succeed).
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

impl From<rusqlite::Error> for IndexError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Self::LockContention(err.to_string())
            }
            Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt) => {
                Self::Corrupted(err.to_string())
            }
            _ => Self::Sqlite(err),
        }
    }
}
