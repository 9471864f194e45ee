//! SQLite-backed collection storage
//!
//! One collection lives in `persist_dir/collection_name/index.sqlite3`.
//! The database runs in WAL mode so readers in other connections never see
//! a half-applied commit, and every commit is a single immediate transaction.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::backend::{CollectionInfo, StorageBackend, StoredCollection, SCHEMA_VERSION};
use crate::error::{IndexError, IndexResult};
use crate::types::{DistanceMetric, IndexEntry, Metadata, MetadataValue};

pub const DB_FILE_NAME: &str = "index.sqlite3";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteBackend {
    db_path: PathBuf,
    collection_name: String,
    conn: Connection,
}

impl SqliteBackend {
    /// Open (creating directories and tables as needed) the database file of
    /// `collection_name` under `persist_dir`
    pub fn open(persist_dir: &Path, collection_name: &str) -> IndexResult<Self> {
        let collection_dir = persist_dir.join(collection_name);
        if collection_dir.exists() && !collection_dir.is_dir() {
            return Err(IndexError::Corrupted(format!(
                "{} exists but is not a collection directory",
                collection_dir.display()
            )));
        }
        fs::create_dir_all(&collection_dir)?;

        let db_path = collection_dir.join(DB_FILE_NAME);
        if db_path.exists() && !db_path.is_file() {
            return Err(IndexError::Corrupted(format!(
                "{} is not a database file",
                db_path.display()
            )));
        }

        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        // WAL is fsynced on every commit, so a successful persist survives power loss
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS collection_info (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entries (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                metadata TEXT NOT NULL,
                embedding BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );
        ",
        )?;

        Ok(Self {
            db_path,
            collection_name: collection_name.to_string(),
            conn,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Count committed entries, optionally restricted to exact metadata
    /// matches evaluated inside SQLite
    pub fn count_committed(&self, filter: Option<&Metadata>) -> IndexResult<usize> {
        let mut sql = String::from("SELECT COUNT(*) FROM entries");
        let mut values: Vec<Value> = Vec::new();

        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            let clauses: Vec<String> = filter
                .iter()
                .map(|(key, value)| filter_clause(key, value, &mut values))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let count: i64 = self.conn.query_row(
            &sql,
            rusqlite::params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn read_info(&self) -> IndexResult<Option<CollectionInfo>> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM collection_info")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        if rows.is_empty() {
            let orphans: i64 = self
                .conn
                .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
            if orphans > 0 {
                return Err(IndexError::Corrupted(format!(
                    "{} has entries but no collection info",
                    self.db_path.display()
                )));
            }
            return Ok(None);
        }

        let get = |key: &str| info_value(&rows, key);

        let name = get("name")?.to_string();
        if name != self.collection_name {
            return Err(IndexError::Corrupted(format!(
                "{} holds collection '{}', expected '{}'",
                self.db_path.display(),
                name,
                self.collection_name
            )));
        }

        let schema_version: u32 = get("schema_version")?
            .parse()
            .map_err(|_| IndexError::Corrupted("invalid schema_version".to_string()))?;
        if schema_version > SCHEMA_VERSION {
            return Err(IndexError::Storage(format!(
                "collection schema version {schema_version} is newer than supported {SCHEMA_VERSION}"
            )));
        }

        let dimensions: usize = get("dimensions")?
            .parse()
            .map_err(|_| IndexError::Corrupted("invalid dimensions".to_string()))?;
        let metric = DistanceMetric::parse(get("metric")?)
            .ok_or_else(|| IndexError::Corrupted("unknown distance metric".to_string()))?;

        Ok(Some(CollectionInfo {
            name,
            dimensions,
            metric,
            schema_version,
            created_at: get("created_at")?.to_string(),
        }))
    }

    fn read_entries(&self, dimensions: usize) -> IndexResult<Vec<IndexEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, text, metadata, embedding FROM entries ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, text, metadata, blob)| {
                let metadata: Metadata = serde_json::from_str(&metadata).map_err(|e| {
                    IndexError::Corrupted(format!("entry {id} has invalid metadata: {e}"))
                })?;
                let embedding = decode_embedding(&blob, dimensions).ok_or_else(|| {
                    IndexError::Corrupted(format!(
                        "entry {id} has a {}-byte embedding, expected {} dimensions",
                        blob.len(),
                        dimensions
                    ))
                })?;
                Ok(IndexEntry {
                    id,
                    text,
                    metadata,
                    embedding,
                })
            })
            .collect()
    }
}

impl StorageBackend for SqliteBackend {
    fn location(&self) -> String {
        self.db_path.display().to_string()
    }

    fn load(&mut self) -> IndexResult<Option<StoredCollection>> {
        let Some(info) = self.read_info()? else {
            return Ok(None);
        };
        let entries = self.read_entries(info.dimensions)?;
        Ok(Some(StoredCollection { info, entries }))
    }

    fn create(&mut self, info: &CollectionInfo) -> IndexResult<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT value FROM collection_info WHERE key = 'name'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(IndexError::Storage(format!(
                "collection '{}' already exists at {}",
                info.name,
                self.db_path.display()
            )));
        }

        {
            let mut insert =
                tx.prepare("INSERT INTO collection_info (key, value) VALUES (?1, ?2)")?;
            insert.execute(params!["name", info.name])?;
            insert.execute(params!["dimensions", info.dimensions.to_string()])?;
            insert.execute(params!["metric", info.metric.as_str()])?;
            insert.execute(params!["schema_version", info.schema_version.to_string()])?;
            insert.execute(params!["created_at", info.created_at])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn commit(&mut self, upserts: &[IndexEntry], deletes: &[String]) -> IndexResult<()> {
        let now = crate::now_iso();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut delete = tx.prepare_cached("DELETE FROM entries WHERE id = ?1")?;
            for id in deletes {
                delete.execute([id])?;
            }

            let mut upsert = tx.prepare_cached(
                "INSERT INTO entries (id, text, metadata, embedding, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    text = excluded.text,
                    metadata = excluded.metadata,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at",
            )?;
            for entry in upserts {
                upsert.execute(params![
                    entry.id,
                    entry.text,
                    serde_json::to_string(&entry.metadata)?,
                    encode_embedding(&entry.embedding),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn info_value<'a>(rows: &'a [(String, String)], key: &str) -> IndexResult<&'a str> {
    rows.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| IndexError::Corrupted(format!("collection info is missing '{key}'")))
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8], dimensions: usize) -> Option<Vec<f32>> {
    if blob.len() != dimensions * 4 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', "\\\""))
}

/// Exact match on one metadata key, pushing its parameters onto `values`.
///
/// `json_extract` turns JSON booleans into 1/0, so the JSON type is checked
/// too: `false` never matches `0` and `"1"` never matches `1`. Integers and
/// reals still compare numerically.
fn filter_clause(key: &str, value: &MetadataValue, values: &mut Vec<Value>) -> String {
    values.push(Value::Text(json_path(key)));
    let path = values.len();

    let (types, param) = match value {
        MetadataValue::Bool(true) => ("'true'", None),
        MetadataValue::Bool(false) => ("'false'", None),
        MetadataValue::Integer(v) => ("'integer', 'real'", Some(Value::Integer(*v))),
        MetadataValue::Float(v) => ("'integer', 'real'", Some(Value::Real(*v))),
        MetadataValue::String(v) => ("'text'", Some(Value::Text(v.clone()))),
    };

    let type_check = format!("json_type(metadata, ?{path}) IN ({types})");
    match param {
        Some(param) => {
            values.push(param);
            format!(
                "({type_check} AND json_extract(metadata, ?{path}) = ?{})",
                values.len()
            )
        }
        None => type_check,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: &str, kind: &str, embedding: Vec<f32>) -> IndexEntry {
        let mut metadata = Metadata::new();
        metadata.insert("type".to_string(), kind.into());
        metadata.insert("draft".to_string(), false.into());
        IndexEntry {
            id: id.to_string(),
            text: format!("text of {id}"),
            metadata,
            embedding,
        }
    }

    #[test]
    fn test_create_commit_and_load() {
        let dir = TempDir::new().unwrap();
        let mut backend = SqliteBackend::open(dir.path(), "docs").unwrap();
        assert!(backend.load().unwrap().is_none());

        backend
            .create(&CollectionInfo::new("docs", 2, DistanceMetric::L2))
            .unwrap();
        backend
            .commit(
                &[entry("a", "x", vec![1.0, 0.5]), entry("b", "y", vec![0.0, -1.0])],
                &[],
            )
            .unwrap();
        backend
            .commit(&[entry("a", "z", vec![2.0, 2.0])], &["b".to_string()])
            .unwrap();

        let mut reopened = SqliteBackend::open(dir.path(), "docs").unwrap();
        let stored = reopened.load().unwrap().unwrap();
        assert_eq!(stored.info.dimensions, 2);
        assert_eq!(stored.info.metric, DistanceMetric::L2);
        assert_eq!(stored.entries.len(), 1);
        assert_eq!(stored.entries[0].embedding, vec![2.0, 2.0]);
        assert_eq!(stored.entries[0].metadata["type"], MetadataValue::from("z"));
    }

    #[test]
    fn test_commits_are_fully_synced() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path(), "docs").unwrap();

        let journal: String = backend
            .conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        let synchronous: i64 = backend
            .conn
            .pragma_query_value(None, "synchronous", |row| row.get(0))
            .unwrap();
        assert_eq!(journal.to_lowercase(), "wal");
        // 2 = FULL
        assert_eq!(synchronous, 2);
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let mut backend = SqliteBackend::open(dir.path(), "docs").unwrap();
        let info = CollectionInfo::new("docs", 2, DistanceMetric::Cosine);
        backend.create(&info).unwrap();
        assert!(backend.create(&info).is_err());
    }

    #[test]
    fn test_count_committed_with_filter() {
        let dir = TempDir::new().unwrap();
        let mut backend = SqliteBackend::open(dir.path(), "docs").unwrap();
        backend
            .create(&CollectionInfo::new("docs", 1, DistanceMetric::Cosine))
            .unwrap();
        backend
            .commit(
                &[
                    entry("a", "x", vec![1.0]),
                    entry("b", "y", vec![1.0]),
                    entry("c", "x", vec![1.0]),
                ],
                &[],
            )
            .unwrap();

        let mut filter = Metadata::new();
        filter.insert("type".to_string(), "x".into());
        assert_eq!(backend.count_committed(Some(&filter)).unwrap(), 2);

        filter.insert("draft".to_string(), false.into());
        assert_eq!(backend.count_committed(Some(&filter)).unwrap(), 2);

        filter.insert("draft".to_string(), true.into());
        assert_eq!(backend.count_committed(Some(&filter)).unwrap(), 0);
        assert_eq!(backend.count_committed(None).unwrap(), 3);
    }

    #[test]
    fn test_sql_filter_agrees_with_in_memory_filter() {
        let dir = TempDir::new().unwrap();
        let mut backend = SqliteBackend::open(dir.path(), "docs").unwrap();
        backend
            .create(&CollectionInfo::new("docs", 1, DistanceMetric::Cosine))
            .unwrap();

        let flags = [
            MetadataValue::Bool(false),
            MetadataValue::Bool(true),
            MetadataValue::Integer(0),
            MetadataValue::Integer(1),
            MetadataValue::Float(0.0),
            MetadataValue::String("0".to_string()),
            MetadataValue::String("true".to_string()),
        ];
        let entries: Vec<IndexEntry> = flags
            .iter()
            .enumerate()
            .map(|(i, flag)| {
                let mut e = entry(&format!("e{i}"), "x", vec![1.0]);
                e.metadata.insert("flag".to_string(), flag.clone());
                e
            })
            .collect();
        backend.commit(&entries, &[]).unwrap();

        for flag in &flags {
            let mut filter = Metadata::new();
            filter.insert("flag".to_string(), flag.clone());
            let in_memory = entries
                .iter()
                .filter(|e| crate::types::metadata_matches(&e.metadata, &filter))
                .count();
            assert_eq!(
                backend.count_committed(Some(&filter)).unwrap(),
                in_memory,
                "filter {flag:?}"
            );
        }

        let mut zero = Metadata::new();
        zero.insert("flag".to_string(), MetadataValue::Integer(0));
        assert_eq!(backend.count_committed(Some(&zero)).unwrap(), 2);
        zero.insert("flag".to_string(), MetadataValue::Bool(false));
        assert_eq!(backend.count_committed(Some(&zero)).unwrap(), 1);
    }

    #[test]
    fn test_garbage_file_is_corruption() {
        let dir = TempDir::new().unwrap();
        let collection_dir = dir.path().join("docs");
        fs::create_dir_all(&collection_dir).unwrap();
        fs::write(collection_dir.join(DB_FILE_NAME), vec![b'x'; 4096]).unwrap();

        let err = SqliteBackend::open(dir.path(), "docs")
            .and_then(|mut b| b.load().map(|_| ()))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Storage);
    }

    #[test]
    fn test_truncated_embedding_is_corruption() {
        let dir = TempDir::new().unwrap();
        let mut backend = SqliteBackend::open(dir.path(), "docs").unwrap();
        backend
            .create(&CollectionInfo::new("docs", 3, DistanceMetric::Cosine))
            .unwrap();
        backend
            .commit(&[entry("a", "x", vec![1.0, 2.0])], &[])
            .unwrap();

        let err = backend.load().unwrap_err();
        assert!(matches!(err, IndexError::Corrupted(_)));
    }

    #[test]
    fn test_collection_path_is_a_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("docs"), b"oops").unwrap();
        assert!(matches!(
            SqliteBackend::open(dir.path(), "docs"),
            Err(IndexError::Corrupted(_))
        ));
    }
}
