//! Common types for documents, chunks and index entries

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Metadata keys written by the chunker
pub mod keys {
    pub const SOURCE: &str = "source";
    pub const FILE_PATH: &str = "file_path";
    pub const SOURCE_TYPE: &str = "source_type";
    pub const CHUNK_INDEX: &str = "chunk_index";
    pub const CHUNK_COUNT: &str = "chunk_count";
    pub const PARENT_CHAR_OFFSET: &str = "parent_char_offset";
    pub const PARENT_ID: &str = "parent_id";
    pub const OVERSIZED: &str = "oversized";
}

/// A scalar metadata value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// NaN and infinities have no JSON form and cannot be stored
    pub fn is_storable(&self) -> bool {
        match self {
            Self::Float(v) => v.is_finite(),
            _ => true,
        }
    }
}

/// Integers and floats compare numerically; other mixed types never match.
impl PartialEq for MetadataValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Integer(a), Self::Float(b)) | (Self::Float(b), Self::Integer(a)) => {
                (*a as f64) == *b
            }
            (Self::String(a), Self::String(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<usize> for MetadataValue {
    fn from(value: usize) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Ordered so serialization and hashing are stable
pub type Metadata = BTreeMap<String, MetadataValue>;

/// True when every filter key is present in `metadata` with an equal value.
/// An empty filter matches everything.
pub fn metadata_matches(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(key, expected)| metadata.get(key).is_some_and(|actual| actual == expected))
}

/// A document as produced by a source connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl DocumentRecord {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Source path used for chunk identity: `source`, then `file_path`.
    pub fn source(&self) -> Option<&str> {
        source_of(&self.metadata)
    }
}

fn source_of(metadata: &Metadata) -> Option<&str> {
    metadata
        .get(keys::SOURCE)
        .or_else(|| metadata.get(keys::FILE_PATH))
        .and_then(MetadataValue::as_str)
}

/// A bounded slice of a parent document, carrying lineage metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub metadata: Metadata,
}

impl Chunk {
    /// Deterministic id from source path, chunk index and content, so that
    /// re-ingesting the same source with the same parameters upserts in place.
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source().unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.chunk_index().unwrap_or_default().to_le_bytes());
        hasher.update([0u8]);
        hasher.update(self.text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn source(&self) -> Option<&str> {
        source_of(&self.metadata)
    }

    pub fn chunk_index(&self) -> Option<i64> {
        self.metadata.get(keys::CHUNK_INDEX).and_then(MetadataValue::as_i64)
    }

    pub fn parent_char_offset(&self) -> Option<i64> {
        self.metadata
            .get(keys::PARENT_CHAR_OFFSET)
            .and_then(MetadataValue::as_i64)
    }

    pub fn is_oversized(&self) -> bool {
        self.metadata
            .get(keys::OVERSIZED)
            .and_then(MetadataValue::as_bool)
            .unwrap_or(false)
    }
}

/// A chunk with its embedding, as stored in a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

impl IndexEntry {
    pub fn from_chunk(chunk: Chunk, embedding: Vec<f32>) -> Self {
        Self {
            id: chunk.id(),
            text: chunk.text,
            metadata: chunk.metadata,
            embedding,
        }
    }
}

/// Similarity metric, fixed per collection at creation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::L2 => "l2",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cosine" => Some(Self::Cosine),
            "l2" => Some(Self::L2),
            _ => None,
        }
    }

    /// Higher is better for both metrics.
    /// L2 uses `1 / (1 + distance)` so scores land in (0, 1].
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => {
                let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
                for (x, y) in a.iter().zip(b) {
                    dot += x * y;
                    norm_a += x * x;
                    norm_b += y * y;
                }
                if norm_a == 0.0 || norm_b == 0.0 {
                    0.0
                } else {
                    dot / (norm_a.sqrt() * norm_b.sqrt())
                }
            }
            Self::L2 => {
                let distance = a
                    .iter()
                    .zip(b)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt();
                1.0 / (1.0 + distance)
            }
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single ranked search result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    /// Relevance score, higher is better
    pub score: f32,
}

impl SearchHit {
    pub fn from_scored(entry: IndexEntry, score: f32) -> Self {
        Self {
            id: entry.id,
            text: entry.text,
            metadata: entry.metadata,
            score,
        }
    }
}
