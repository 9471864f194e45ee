//! Persistent vector index over (text, embedding, metadata) entries
//!
//! [`VectorIndex`] keeps a live in-memory view of the collection that
//! searches run against, plus a buffer of writes not yet committed to the
//! [`StorageBackend`]. `add`/`delete` update both under one write lock, so a
//! batch becomes visible to searches all at once; `persist` commits the
//! buffer as one backend transaction.

mod backend;
mod sqlite;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

pub use backend::{CollectionInfo, MemoryBackend, StorageBackend, StoredCollection, SCHEMA_VERSION};
pub use sqlite::{SqliteBackend, DB_FILE_NAME};

use crate::embedding::Embedder;
use crate::error::{IndexError, IndexResult};
use crate::events::{IndexEvent, IndexEventKind, SharedObserver};
use crate::types::{metadata_matches, DistanceMetric, IndexEntry, Metadata};

/// Outcome of [`VectorIndex::add`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AddResult {
    /// Ids not present before
    pub inserted: usize,
    /// Ids that replaced an existing entry
    pub updated: usize,
}

/// Outcome of [`VectorIndex::persist`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistResult {
    pub upserted: usize,
    pub deleted: usize,
}

#[derive(Debug)]
enum PendingWrite {
    Upsert(IndexEntry),
    Delete,
}

pub struct VectorIndex {
    info: CollectionInfo,
    location: String,
    backend: Mutex<Box<dyn StorageBackend>>,
    entries: RwLock<HashMap<String, IndexEntry>>,
    pending: Mutex<BTreeMap<String, PendingWrite>>,
    observer: Option<SharedObserver>,
}

impl VectorIndex {
    /// Open or create `collection_name` under `persist_dir`, sized for the
    /// embedder's dimensionality, with cosine similarity
    pub fn open(
        persist_dir: impl AsRef<Path>,
        collection_name: &str,
        embedder: &dyn Embedder,
    ) -> IndexResult<Self> {
        Self::open_with(
            persist_dir,
            collection_name,
            embedder.dimensions(),
            DistanceMetric::default(),
        )
    }

    /// Open or create a file-backed collection
    pub fn open_with(
        persist_dir: impl AsRef<Path>,
        collection_name: &str,
        dimensions: usize,
        metric: DistanceMetric,
    ) -> IndexResult<Self> {
        validate_collection_name(collection_name)?;
        let backend = SqliteBackend::open(persist_dir.as_ref(), collection_name)?;
        Self::with_backend(Box::new(backend), collection_name, dimensions, metric)
    }

    /// Create a non-durable collection
    pub fn in_memory(
        collection_name: &str,
        dimensions: usize,
        metric: DistanceMetric,
    ) -> IndexResult<Self> {
        Self::with_backend(
            Box::new(MemoryBackend::new()),
            collection_name,
            dimensions,
            metric,
        )
    }

    /// Load the collection from `backend`, creating it if absent.
    ///
    /// An existing collection keeps its stored metric; a different stored
    /// dimensionality is a configuration error.
    pub fn with_backend(
        mut backend: Box<dyn StorageBackend>,
        collection_name: &str,
        dimensions: usize,
        metric: DistanceMetric,
    ) -> IndexResult<Self> {
        validate_collection_name(collection_name)?;
        if dimensions == 0 {
            return Err(IndexError::Configuration(
                "embedding dimensions must be greater than 0".to_string(),
            ));
        }

        let location = backend.location();
        let (info, entries) = match backend.load()? {
            Some(stored) => {
                if stored.info.name != collection_name {
                    return Err(IndexError::Corrupted(format!(
                        "{} holds collection '{}', expected '{}'",
                        location, stored.info.name, collection_name
                    )));
                }
                if stored.info.dimensions != dimensions {
                    return Err(IndexError::DimensionMismatch {
                        expected: stored.info.dimensions,
                        actual: dimensions,
                    });
                }
                if stored.info.metric != metric {
                    log::warn!(
                        "Collection {} was created with metric {}, ignoring requested {}",
                        collection_name,
                        stored.info.metric,
                        metric
                    );
                }
                log::info!(
                    "Loaded existing collection {} ({} entries) from {}",
                    collection_name,
                    stored.entries.len(),
                    location
                );
                (stored.info, stored.entries)
            }
            None => {
                let info = CollectionInfo::new(collection_name, dimensions, metric);
                backend.create(&info)?;
                log::info!("Creating new collection {} at {}", collection_name, location);
                (info, Vec::new())
            }
        };

        let entries = entries
            .into_iter()
            .map(|entry| (entry.id.clone(), entry))
            .collect();

        Ok(Self {
            info,
            location,
            backend: Mutex::new(backend),
            entries: RwLock::new(entries),
            pending: Mutex::new(BTreeMap::new()),
            observer: None,
        })
    }

    /// Attach an observer for add/delete/persist/search events
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn info(&self) -> &CollectionInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn dimensions(&self) -> usize {
        self.info.dimensions
    }

    pub fn metric(&self) -> DistanceMetric {
        self.info.metric
    }

    /// Where the collection is stored
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Number of live entries, including unpersisted writes
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Writes buffered since the last successful persist
    pub fn pending_writes(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn get(&self, id: &str) -> Option<IndexEntry> {
        self.entries.read().get(id).cloned()
    }

    /// Upsert entries by id. The whole batch is validated first and applied
    /// atomically; it is durable only after [`persist`](Self::persist).
    pub fn add(&self, entries: Vec<IndexEntry>) -> IndexResult<AddResult> {
        let start = Instant::now();
        for entry in &entries {
            if entry.id.is_empty() {
                return Err(IndexError::Validation("entry id must not be empty".to_string()));
            }
            self.check_dimensions(entry.embedding.len())?;
            check_storable(entry)?;
        }

        let mut result = AddResult::default();
        {
            let mut pending = self.pending.lock();
            let mut live = self.entries.write();
            for entry in entries {
                if live.contains_key(&entry.id) {
                    result.updated += 1;
                } else {
                    result.inserted += 1;
                }
                pending.insert(entry.id.clone(), PendingWrite::Upsert(entry.clone()));
                live.insert(entry.id.clone(), entry);
            }
        }

        self.emit(IndexEventKind::Add, result.inserted + result.updated, start);
        Ok(result)
    }

    /// Remove entries by id; unknown ids are ignored. Returns how many were removed.
    pub fn delete(&self, ids: &[String]) -> IndexResult<usize> {
        let start = Instant::now();
        let mut removed = 0;
        {
            let mut pending = self.pending.lock();
            let mut live = self.entries.write();
            for id in ids {
                if live.remove(id).is_some() {
                    pending.insert(id.clone(), PendingWrite::Delete);
                    removed += 1;
                }
            }
        }

        self.emit(IndexEventKind::Delete, removed, start);
        Ok(removed)
    }

    /// Remove every entry whose metadata matches `filter`
    pub fn delete_where(&self, filter: &Metadata) -> IndexResult<usize> {
        if filter.is_empty() {
            return Err(IndexError::InvalidArgument(
                "delete filter must not be empty".to_string(),
            ));
        }

        let ids: Vec<String> = self
            .entries
            .read()
            .values()
            .filter(|entry| metadata_matches(&entry.metadata, filter))
            .map(|entry| entry.id.clone())
            .collect();
        self.delete(&ids)
    }

    /// Return at most `k` entries ranked best-first.
    ///
    /// The filter restricts the candidate set before ranking, so fewer than
    /// `k` results means fewer than `k` entries match.
    pub fn search(
        &self,
        query_embedding: &[f32],
        k: usize,
        filter: Option<&Metadata>,
    ) -> IndexResult<Vec<(IndexEntry, f32)>> {
        let start = Instant::now();
        if k == 0 {
            return Err(IndexError::InvalidArgument("k must be greater than 0".to_string()));
        }
        self.check_dimensions(query_embedding.len())?;

        let metric = self.info.metric;
        let results: Vec<(IndexEntry, f32)> = {
            let live = self.entries.read();
            let mut scored: Vec<(&IndexEntry, f32)> = live
                .values()
                .filter(|entry| filter.map_or(true, |f| metadata_matches(&entry.metadata, f)))
                .map(|entry| (entry, metric.score(query_embedding, &entry.embedding)))
                .collect();

            scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
            scored.truncate(k);
            scored
                .into_iter()
                .map(|(entry, score)| (entry.clone(), score))
                .collect()
        };

        log::debug!(
            "Search in {} returned {} of at most {} results",
            self.info.name,
            results.len(),
            k
        );
        self.emit(IndexEventKind::Search, results.len(), start);
        Ok(results)
    }

    /// Commit buffered writes. On failure they stay buffered and the stored
    /// collection is unchanged.
    pub fn persist(&self) -> IndexResult<PersistResult> {
        let start = Instant::now();
        let mut backend = self.backend.lock();

        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(PersistResult::default());
        }

        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for (id, write) in batch {
            match write {
                PendingWrite::Upsert(entry) => upserts.push(entry),
                PendingWrite::Delete => deletes.push(id),
            }
        }

        if let Err(err) = backend.commit(&upserts, &deletes) {
            log::warn!("Persisting collection {} failed: {}", self.info.name, err);
            // Writes buffered while committing are newer and win
            let mut pending = self.pending.lock();
            for entry in upserts {
                pending
                    .entry(entry.id.clone())
                    .or_insert(PendingWrite::Upsert(entry));
            }
            for id in deletes {
                pending.entry(id).or_insert(PendingWrite::Delete);
            }
            return Err(err);
        }

        let result = PersistResult {
            upserted: upserts.len(),
            deleted: deletes.len(),
        };
        log::info!(
            "Persisted collection {}: {} upserted, {} deleted",
            self.info.name,
            result.upserted,
            result.deleted
        );
        self.emit(IndexEventKind::Persist, result.upserted + result.deleted, start);
        Ok(result)
    }

    fn check_dimensions(&self, actual: usize) -> IndexResult<()> {
        if actual != self.info.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.info.dimensions,
                actual,
            });
        }
        Ok(())
    }

    fn emit(&self, kind: IndexEventKind, count: usize, start: Instant) {
        if let Some(ref observer) = self.observer {
            observer.on_event(&IndexEvent {
                kind,
                collection: self.info.name.clone(),
                count,
                duration: start.elapsed(),
            });
        }
    }
}

fn check_storable(entry: &IndexEntry) -> IndexResult<()> {
    if entry.embedding.iter().any(|v| !v.is_finite()) {
        return Err(IndexError::Validation(format!(
            "entry {} has a non-finite embedding component",
            entry.id
        )));
    }
    if let Some((key, value)) = entry.metadata.iter().find(|(_, v)| !v.is_storable()) {
        return Err(IndexError::Validation(format!(
            "entry {} has non-finite metadata {key} = {value}",
            entry.id
        )));
    }
    Ok(())
}

/// Collection names become directory names
pub fn validate_collection_name(name: &str) -> IndexResult<()> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed != name
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(IndexError::Configuration(format!(
            "invalid collection name '{name}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetadataValue;

    fn entry(id: &str, embedding: Vec<f32>) -> IndexEntry {
        IndexEntry {
            id: id.to_string(),
            text: id.to_string(),
            metadata: Metadata::new(),
            embedding,
        }
    }

    #[test]
    fn test_upsert_counts() {
        let index = VectorIndex::in_memory("t", 2, DistanceMetric::Cosine).unwrap();
        let first = index
            .add(vec![entry("a", vec![1.0, 0.0]), entry("b", vec![0.0, 1.0])])
            .unwrap();
        assert_eq!(first, AddResult { inserted: 2, updated: 0 });

        let second = index.add(vec![entry("a", vec![0.5, 0.5])]).unwrap();
        assert_eq!(second, AddResult { inserted: 0, updated: 1 });
        assert_eq!(index.len(), 2);
        assert_eq!(index.pending_writes(), 2);
    }

    #[test]
    fn test_add_is_all_or_nothing() {
        let index = VectorIndex::in_memory("t", 2, DistanceMetric::Cosine).unwrap();
        let err = index
            .add(vec![entry("a", vec![1.0, 0.0]), entry("b", vec![1.0])])
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { expected: 2, actual: 1 }));
        assert!(index.is_empty());
        assert_eq!(index.pending_writes(), 0);
    }

    #[test]
    fn test_search_ranks_best_first() {
        let index = VectorIndex::in_memory("t", 2, DistanceMetric::L2).unwrap();
        index
            .add(vec![
                entry("far", vec![10.0, 10.0]),
                entry("near", vec![1.0, 1.0]),
                entry("exact", vec![0.0, 0.0]),
            ])
            .unwrap();

        let hits = index.search(&[0.0, 0.0], 2, None).unwrap();
        let ids: Vec<&str> = hits.iter().map(|(e, _)| e.id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "near"]);
        assert_eq!(hits[0].1, 1.0);
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn test_add_rejects_non_finite_values() {
        let index = VectorIndex::in_memory("t", 2, DistanceMetric::Cosine).unwrap();

        let mut nan_metadata = entry("b", vec![1.0, 0.0]);
        nan_metadata
            .metadata
            .insert("score".to_string(), MetadataValue::Float(f64::NAN));
        let err = index
            .add(vec![entry("a", vec![1.0, 0.0]), nan_metadata])
            .unwrap_err();
        assert!(matches!(err, IndexError::Validation(_)));

        let err = index
            .add(vec![entry("c", vec![f32::INFINITY, 0.0])])
            .unwrap_err();
        assert!(matches!(err, IndexError::Validation(_)));

        assert!(index.is_empty());
        assert_eq!(index.pending_writes(), 0);
    }

    #[test]
    fn test_search_argument_errors() {
        let index = VectorIndex::in_memory("t", 2, DistanceMetric::Cosine).unwrap();
        assert!(matches!(
            index.search(&[1.0, 0.0], 0, None),
            Err(IndexError::InvalidArgument(_))
        ));
        assert!(matches!(
            index.search(&[1.0], 1, None),
            Err(IndexError::DimensionMismatch { .. })
        ));
        assert!(index.search(&[1.0, 0.0], 5, None).unwrap().is_empty());
    }

    #[test]
    fn test_delete_then_persist() {
        let backend = MemoryBackend::new();
        let index = VectorIndex::with_backend(
            Box::new(backend.clone()),
            "t",
            1,
            DistanceMetric::Cosine,
        )
        .unwrap();
        index.add(vec![entry("a", vec![1.0]), entry("b", vec![1.0])]).unwrap();
        index.persist().unwrap();
        assert_eq!(backend.committed_len(), 2);

        assert_eq!(index.delete(&["a".to_string(), "zzz".to_string()]).unwrap(), 1);
        let result = index.persist().unwrap();
        assert_eq!(result, PersistResult { upserted: 0, deleted: 1 });
        assert_eq!(backend.committed_len(), 1);
        assert_eq!(index.persist().unwrap(), PersistResult::default());
    }

    #[test]
    fn test_collection_names() {
        assert!(validate_collection_name("rag_collection").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name(" padded").is_err());
        assert!(validate_collection_name("a/b").is_err());
        assert!(validate_collection_name("..").is_err());
    }
}
