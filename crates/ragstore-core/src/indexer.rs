//! Index manager: chunk, embed, store, search

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::chunker::TextChunker;
use super::config::{EmbeddingConfig, IndexConfig, RetryPolicy};
use super::embedding::Embedder;
use super::error::{IndexError, IndexResult};
use super::events::SharedObserver;
use super::types::{keys, Chunk, DocumentRecord, IndexEntry, Metadata, SearchHit};
use super::vector_store::{PersistResult, VectorIndex};

/// What happened to one input record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RecordStatus {
    /// Chunked, embedded and stored
    Indexed { chunks: usize },
    /// Rejected before embedding (e.g. empty text)
    Skipped { reason: String },
    /// Embedding failed after retries
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    /// Position in the input batch
    pub index: usize,
    pub source: Option<String>,
    #[serde(flatten)]
    pub status: RecordStatus,
}

/// Result of [`IndexManager::add_documents`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddReport {
    pub total_records: usize,
    /// Chunks produced from all valid records
    pub total_chunks: usize,
    /// Entries added and persisted
    pub entries_written: usize,
    /// One per input record, in input order
    pub outcomes: Vec<RecordOutcome>,
    pub elapsed_ms: u64,
}

impl AddReport {
    pub fn indexed(&self) -> usize {
        self.count(|s| matches!(s, RecordStatus::Indexed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, RecordStatus::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, RecordStatus::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&RecordStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

/// Progress of an add operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexProgress {
    /// Current phase: "chunking", "embedding", "storing", "done"
    pub phase: String,
    pub current: usize,
    pub total: usize,
    /// Percentage complete (0-100)
    pub percent: u8,
    pub message: Option<String>,
}

impl IndexProgress {
    fn new(phase: &str, current: usize, total: usize, message: String) -> Self {
        let percent = if total == 0 {
            100
        } else {
            ((current.min(total) * 100) / total) as u8
        };
        Self {
            phase: phase.to_string(),
            current,
            total,
            percent,
            message: Some(message),
        }
    }
}

/// Composition root: owns the embedder, the chunker and one collection
pub struct IndexManager {
    embedder: Arc<dyn Embedder>,
    index: VectorIndex,
    chunker: TextChunker,
    retry: RetryPolicy,
    batch_size: usize,
}

impl IndexManager {
    pub fn new(embedder: Arc<dyn Embedder>, index: VectorIndex, chunker: TextChunker) -> Self {
        Self {
            embedder,
            index,
            chunker,
            retry: RetryPolicy::default(),
            batch_size: EmbeddingConfig::default().batch_size,
        }
    }

    /// Open (or create) the configured collection
    pub fn open(config: &IndexConfig, embedder: Arc<dyn Embedder>) -> IndexResult<Self> {
        config.validate()?;
        let chunker = config.chunking.build_chunker()?;

        if embedder.dimensions() != config.embedding.dimensions {
            log::warn!(
                "Embedder {} reports {} dimensions, config says {}; using the embedder's",
                embedder.name(),
                embedder.dimensions(),
                config.embedding.dimensions
            );
        }

        let index = VectorIndex::open_with(
            config.store.persist_dir(),
            &config.store.collection_name,
            embedder.dimensions(),
            config.store.metric,
        )?;

        Ok(Self::new(embedder, index, chunker)
            .with_retry(RetryPolicy::from(&config.embedding))
            .with_batch_size(config.embedding.batch_size))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Texts per embedding call. Timeout and retries apply to each call.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Forward index events to `observer`
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.index = self.index.with_observer(observer);
        self
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn chunker(&self) -> &TextChunker {
        &self.chunker
    }

    /// Number of entries in the collection
    pub fn count(&self) -> usize {
        self.index.len()
    }

    /// Chunk, embed, add and persist `records`
    pub async fn add_documents(&self, records: Vec<DocumentRecord>) -> IndexResult<AddReport> {
        self.add_documents_with_progress(records, |_| {}).await
    }

    /// Like [`add_documents`](Self::add_documents), reporting progress.
    ///
    /// Bad records and embedding failures are reported per record; a
    /// configuration or storage error aborts the whole call.
    pub async fn add_documents_with_progress<F>(
        &self,
        records: Vec<DocumentRecord>,
        mut on_progress: F,
    ) -> IndexResult<AddReport>
    where
        F: FnMut(IndexProgress),
    {
        let start = Instant::now();
        let total_records = records.len();
        let mut outcomes = Vec::with_capacity(total_records);

        // Phase 1: Chunking
        on_progress(IndexProgress::new(
            "chunking",
            0,
            total_records,
            format!("Splitting {total_records} documents"),
        ));

        let mut chunked: Vec<(usize, Option<String>, Vec<Chunk>)> = Vec::new();
        for (index, record) in records.iter().enumerate() {
            let source = record.source().map(str::to_string);
            match self.chunker.split_document(record) {
                Ok(chunks) => chunked.push((index, source, chunks)),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    log::warn!("Skipping document {}: {}", index, err);
                    outcomes.push(RecordOutcome {
                        index,
                        source,
                        status: RecordStatus::Skipped {
                            reason: err.to_string(),
                        },
                    });
                }
            }
        }

        let total_chunks: usize = chunked.iter().map(|(_, _, chunks)| chunks.len()).sum();
        log::info!("Split {} documents into {} chunks", total_records, total_chunks);

        // Phase 2: Embedding
        let to_embed = chunked.len();
        let mut entries: Vec<IndexEntry> = Vec::with_capacity(total_chunks);
        for (done, (index, source, chunks)) in chunked.into_iter().enumerate() {
            on_progress(IndexProgress::new(
                "embedding",
                done,
                to_embed,
                format!("Embedding {} chunks of document {}", chunks.len(), index),
            ));

            let chunk_count = chunks.len();
            match self.embed_chunks(chunks).await {
                Ok(embedded) => {
                    entries.extend(embedded);
                    outcomes.push(RecordOutcome {
                        index,
                        source,
                        status: RecordStatus::Indexed {
                            chunks: chunk_count,
                        },
                    });
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    log::warn!("Embedding document {} failed: {}", index, err);
                    outcomes.push(RecordOutcome {
                        index,
                        source,
                        status: RecordStatus::Failed {
                            error: err.to_string(),
                        },
                    });
                }
            }
        }

        // Phase 3: Storing
        let entries_written = entries.len();
        on_progress(IndexProgress::new(
            "storing",
            0,
            entries_written,
            format!("Writing {entries_written} entries"),
        ));
        if !entries.is_empty() {
            self.index.add(entries)?;
        }
        self.persist().await?;

        outcomes.sort_by_key(|o| o.index);
        let report = AddReport {
            total_records,
            total_chunks,
            entries_written,
            outcomes,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };

        on_progress(IndexProgress::new(
            "done",
            total_records,
            total_records,
            format!(
                "Indexed {} of {} documents ({} entries)",
                report.indexed(),
                total_records,
                entries_written
            ),
        ));

        Ok(report)
    }

    /// Embed `query` and return the `k` best matching chunks
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&Metadata>,
    ) -> IndexResult<Vec<SearchHit>> {
        if k == 0 {
            return Err(IndexError::InvalidArgument("k must be greater than 0".to_string()));
        }
        if query.trim().is_empty() {
            return Err(IndexError::InvalidArgument("query must not be empty".to_string()));
        }

        let embedder = &self.embedder;
        let vector = self
            .retrying("embed query", move || embedder.embed_query(query))
            .await?;

        let hits = self.index.search(&vector, k, filter)?;
        Ok(hits
            .into_iter()
            .map(|(entry, score)| SearchHit::from_scored(entry, score))
            .collect())
    }

    /// Commit buffered writes, retrying while the collection is locked
    pub async fn persist(&self) -> IndexResult<PersistResult> {
        let mut attempt = 0;
        loop {
            match self.index.persist() {
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    log::warn!("Persist failed ({}), retrying in {:?}", err, delay);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Delete every chunk that came from `source` and persist
    pub async fn remove_source(&self, source: &str) -> IndexResult<usize> {
        let mut removed = 0;
        for key in [keys::SOURCE, keys::FILE_PATH] {
            let mut filter = Metadata::new();
            filter.insert(key.to_string(), source.into());
            removed += self.index.delete_where(&filter)?;
        }
        self.persist().await?;
        Ok(removed)
    }

    async fn embed_chunks(&self, chunks: Vec<Chunk>) -> IndexResult<Vec<IndexEntry>> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedder = &self.embedder;
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let embedded = self
                .retrying("embed", move || embedder.embed(batch))
                .await?;
            if embedded.len() != batch.len() {
                return Err(IndexError::Embedding(format!(
                    "Embedding count mismatch: sent {} texts, got {} embeddings",
                    batch.len(),
                    embedded.len()
                )));
            }
            vectors.extend(embedded);
        }

        if let Some(bad) = vectors.iter().find(|v| v.len() != self.index.dimensions()) {
            return Err(IndexError::DimensionMismatch {
                expected: self.index.dimensions(),
                actual: bad.len(),
            });
        }

        Ok(chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry::from_chunk(chunk, vector))
            .collect())
    }

    /// Run an embedding call with a timeout, retrying transient failures
    /// with exponential backoff
    async fn retrying<T, F, Fut>(&self, what: &str, mut call: F) -> IndexResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = IndexResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.retry.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(IndexError::EmbeddingTimeout(self.retry.timeout)),
            };

            match result {
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    log::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what,
                        attempt,
                        self.retry.max_retries + 1,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
