//! Storage engines behind a collection

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{IndexError, IndexResult};
use crate::types::{DistanceMetric, IndexEntry};

pub const SCHEMA_VERSION: u32 = 1;

/// Fixed properties of a collection, recorded at creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub dimensions: usize,
    pub metric: DistanceMetric,
    pub schema_version: u32,
    pub created_at: String,
}

impl CollectionInfo {
    pub fn new(name: impl Into<String>, dimensions: usize, metric: DistanceMetric) -> Self {
        Self {
            name: name.into(),
            dimensions,
            metric,
            schema_version: SCHEMA_VERSION,
            created_at: crate::now_iso(),
        }
    }
}

/// Everything a backend holds for one collection
#[derive(Debug, Clone)]
pub struct StoredCollection {
    pub info: CollectionInfo,
    pub entries: Vec<IndexEntry>,
}

/// Durable (or not) home of one collection.
///
/// `commit` must be atomic: either every upsert and delete is applied or
/// the stored state is left as it was.
pub trait StorageBackend: Send {
    /// Human readable location, for logs
    fn location(&self) -> String;

    /// Load the collection, `None` if it was never created
    fn load(&mut self) -> IndexResult<Option<StoredCollection>>;

    /// Record a new, empty collection
    fn create(&mut self, info: &CollectionInfo) -> IndexResult<()>;

    /// Apply upserts (by id) and deletes as one unit
    fn commit(&mut self, upserts: &[IndexEntry], deletes: &[String]) -> IndexResult<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    info: Option<CollectionInfo>,
    entries: BTreeMap<String, IndexEntry>,
}

/// Non-durable backend. Clones share the same committed state, so a
/// "reopen" within one process sees earlier commits.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed entries
    pub fn committed_len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

impl StorageBackend for MemoryBackend {
    fn location(&self) -> String {
        "memory".to_string()
    }

    fn load(&mut self) -> IndexResult<Option<StoredCollection>> {
        let state = self.state.lock();
        Ok(state.info.clone().map(|info| StoredCollection {
            info,
            entries: state.entries.values().cloned().collect(),
        }))
    }

    fn create(&mut self, info: &CollectionInfo) -> IndexResult<()> {
        let mut state = self.state.lock();
        if state.info.is_some() {
            return Err(IndexError::Storage(format!(
                "collection '{}' already exists",
                info.name
            )));
        }
        state.info = Some(info.clone());
        Ok(())
    }

    fn commit(&mut self, upserts: &[IndexEntry], deletes: &[String]) -> IndexResult<()> {
        let mut state = self.state.lock();
        if state.info.is_none() {
            return Err(IndexError::Storage("collection was not created".to_string()));
        }
        for id in deletes {
            state.entries.remove(id);
        }
        for entry in upserts {
            state.entries.insert(entry.id.clone(), entry.clone());
        }
        Ok(())
    }
}
