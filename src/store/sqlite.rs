//! SQLite binding of the memory store, with `sqlite-vec` cosine ranking.
//!
//! Schema: `entries` carries content, hashes, timestamps, the optional
//! triple, and JSON-encoded tags/metadata/references; `embeddings` holds
//! one JSON float array per entry; `documents` backs the
//! [`DocumentStore`] interface. Each `store` call is one transaction;
//! deleting an entry cascades to its embedding. Vector ranking happens in
//! SQL through `vec_distance_cosine`, every other filter clause is
//! re-checked in Rust so both bindings share exact semantics.

use std::os::raw::c_char;
use std::path::Path;
use std::sync::Arc;
use std::sync::Once;

use async_trait::async_trait;
use tokio_rusqlite::{Connection, OptionalExtension, ffi};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    DocumentStore, MemoryEntry, MemoryEntryPatch, MemoryFilter, MemoryQueryResult, MemoryStore,
    ScoredEntry, pad_or_truncate,
};
use crate::error::StoreError;
use crate::model::Document;
use crate::oracle::EmbeddingOracle;
use crate::progress::{PipelineStage, Progress, ProgressSink};

/// Upper bound on entries returned by one query.
pub const DEFAULT_QUERY_LIMIT: usize = 50;

/// Pre-filter candidate pool for ranked queries; clauses applied in Rust
/// may discard most of it.
const CANDIDATE_POOL: usize = 256;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entries (
    id           TEXT PRIMARY KEY,
    content      TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    subject      TEXT,
    predicate    TEXT,
    object       TEXT,
    meta_json    TEXT NOT NULL,
    tags_json    TEXT NOT NULL,
    refs_json    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entries_created ON entries(created_at);
CREATE INDEX IF NOT EXISTS idx_entries_subject ON entries(subject);
CREATE INDEX IF NOT EXISTS idx_entries_object ON entries(object);
CREATE TABLE IF NOT EXISTS embeddings (
    entry_id    TEXT PRIMARY KEY REFERENCES entries(id) ON DELETE CASCADE,
    dim         INTEGER NOT NULL,
    vector_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS documents (
    id       TEXT PRIMARY KEY,
    doc_json TEXT NOT NULL
);
";

const ENTRY_COLUMNS: &str = "e.id, e.content, e.content_hash, e.created_at, e.updated_at, \
     e.subject, e.predicate, e.object, e.meta_json, e.tags_json, e.refs_json, emb.vector_json";

/// SQLite-backed [`MemoryStore`] and [`DocumentStore`].
#[derive(Clone)]
pub struct SqliteMemoryStore {
    conn: Connection,
    embedder: Arc<dyn EmbeddingOracle>,
    dim: usize,
}

impl SqliteMemoryStore {
    /// Open (or create) the store at `path`.
    pub async fn open(
        path: impl AsRef<Path>,
        embedder: Arc<dyn EmbeddingOracle>,
        dim: usize,
    ) -> Result<Self, StoreError> {
        register_sqlite_vec()?;
        let conn = Connection::open(path).await.map_err(|e| to_store_error(e))?;
        conn.call(|conn| {
            conn.query_row("select vec_version()", [], |row| row.get::<_, String>(0))
                ?;
            conn.execute_batch(SCHEMA)
                ?;
            Ok::<(), tokio_rusqlite::rusqlite::Error>(())
        })
        .await
        .map_err(|e| to_store_error(e))?;
        Ok(Self {
            conn,
            embedder,
            dim,
        })
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, StoreError> {
        let vectors = self
            .embedder
            .embed(std::slice::from_ref(&text.to_string()))
            .await
            .map_err(|err| StoreError::backend(format!("query embedding failed: {err}")))?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::backend("embedding oracle returned no vector"))?;
        Ok(pad_or_truncate(vector, self.dim))
    }

    async fn ranked(
        &self,
        query: Vec<f32>,
        filter: Option<&MemoryFilter>,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        let query_json = serde_json::to_string(&query)?;
        let filter = filter.cloned();

        let mut scored = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {ENTRY_COLUMNS}, \
                     vec_distance_cosine(vec_f32(emb.vector_json), vec_f32(?1)) AS distance \
                     FROM entries e \
                     JOIN embeddings emb ON emb.entry_id = e.id \
                     ORDER BY distance ASC \
                     LIMIT {CANDIDATE_POOL}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([&query_json], |row| {
                        let entry = row_to_entry(row)?;
                        let distance: f32 = row.get(12)?;
                        Ok(ScoredEntry { entry, distance })
                    })
                    ?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok::<Vec<ScoredEntry>, tokio_rusqlite::rusqlite::Error>(out)
            })
            .await
            .map_err(|e| to_store_error(e))?;

        if let Some(filter) = &filter {
            scored.retain(|s| filter.matches(&s.entry));
            if let Some(max) = filter.max_distance {
                scored.retain(|s| s.distance <= max);
            }
        }
        scored.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| b.entry.updated_at.cmp(&a.entry.updated_at))
        });
        scored.truncate(DEFAULT_QUERY_LIMIT);
        Ok(scored)
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn store(
        &self,
        entries: Vec<MemoryEntry>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let total = entries.len() as u64;
        let dim = self.dim;

        // Serialize rows up front so the transaction closure is pure SQL.
        let mut rows = Vec::with_capacity(entries.len());
        for (idx, mut entry) in entries.into_iter().enumerate() {
            entry.embedding = pad_or_truncate(entry.embedding, dim);
            rows.push(entry_to_row(&entry)?);
            progress.publish(Progress::new(
                PipelineStage::StoreEntries,
                idx as u64 + 1,
                total,
            ));
        }

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for row in rows {
                    tx.execute(
                        "INSERT OR REPLACE INTO entries \
                         (id, content, content_hash, created_at, updated_at, subject, predicate, \
                          object, meta_json, tags_json, refs_json) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                        (
                            &row.id,
                            &row.content,
                            &row.content_hash,
                            &row.created_at,
                            &row.updated_at,
                            &row.subject,
                            &row.predicate,
                            &row.object,
                            &row.meta_json,
                            &row.tags_json,
                            &row.refs_json,
                        ),
                    )
                    ?;
                    tx.execute(
                        "INSERT OR REPLACE INTO embeddings (entry_id, dim, vector_json) \
                         VALUES (?1, ?2, ?3)",
                        (&row.id, row.dim as i64, &row.vector_json),
                    )
                    ?;
                }
                tx.commit()?;
                Ok::<(), tokio_rusqlite::rusqlite::Error>(())
            })
            .await
            .map_err(|e| to_store_error(e))?;

        progress.publish_final(Progress::new(PipelineStage::StoreEntries, total, total));
        Ok(())
    }

    async fn update(&self, id: Uuid, patch: MemoryEntryPatch) -> Result<(), StoreError> {
        let mut entry = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        patch.apply_to(&mut entry);
        entry.embedding = pad_or_truncate(entry.embedding, self.dim);
        let row = entry_to_row(&entry)?;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE entries SET content = ?2, content_hash = ?3, updated_at = ?4, \
                     subject = ?5, predicate = ?6, object = ?7, meta_json = ?8, tags_json = ?9, \
                     refs_json = ?10 WHERE id = ?1",
                    (
                        &row.id,
                        &row.content,
                        &row.content_hash,
                        &row.updated_at,
                        &row.subject,
                        &row.predicate,
                        &row.object,
                        &row.meta_json,
                        &row.tags_json,
                        &row.refs_json,
                    ),
                )
                ?;
                tx.execute(
                    "INSERT OR REPLACE INTO embeddings (entry_id, dim, vector_json) \
                     VALUES (?1, ?2, ?3)",
                    (&row.id, row.dim as i64, &row.vector_json),
                )
                ?;
                tx.commit()?;
                Ok::<(), tokio_rusqlite::rusqlite::Error>(())
            })
            .await
            .map_err(|e| to_store_error(e))
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let key = id.to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM embeddings WHERE entry_id = ?1", [&key])
                    ?;
                let deleted = tx
                    .execute("DELETE FROM entries WHERE id = ?1", [&key])
                    ?;
                tx.commit()?;
                Ok::<usize, tokio_rusqlite::rusqlite::Error>(deleted)
            })
            .await
            .map_err(|e| to_store_error(e))?;
        if deleted == 0 {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryEntry>, StoreError> {
        let key = id.to_string();
        self.conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {ENTRY_COLUMNS} FROM entries e \
                     JOIN embeddings emb ON emb.entry_id = e.id WHERE e.id = ?1"
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_row([&key], row_to_entry)
                    .optional()
            })
            .await
            .map_err(|e| to_store_error(e))
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.conn
            .call(|conn| {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))
                    ?;
                Ok::<usize, tokio_rusqlite::rusqlite::Error>(count as usize)
            })
            .await
            .map_err(|e| to_store_error(e))
    }

    async fn query(
        &self,
        text: &str,
        filter: Option<&MemoryFilter>,
    ) -> Result<MemoryQueryResult, StoreError> {
        let scored = self.query_with_distance(text, filter).await?;
        Ok(MemoryQueryResult {
            entries: scored.into_iter().map(|s| s.entry).collect(),
            aggregates: Vec::new(),
        })
    }

    async fn query_with_distance(
        &self,
        text: &str,
        filter: Option<&MemoryFilter>,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        let query = self.embed_query(text).await?;
        self.ranked(query, filter).await
    }
}

#[async_trait]
impl DocumentStore for SqliteMemoryStore {
    async fn put_documents(&self, documents: &[Document]) -> Result<(), StoreError> {
        let mut rows = Vec::with_capacity(documents.len());
        for doc in documents {
            rows.push((doc.id.clone(), serde_json::to_string(doc)?));
        }
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for (id, json) in rows {
                    tx.execute(
                        "INSERT OR REPLACE INTO documents (id, doc_json) VALUES (?1, ?2)",
                        (&id, &json),
                    )
                    ?;
                }
                tx.commit()?;
                Ok::<(), tokio_rusqlite::rusqlite::Error>(())
            })
            .await
            .map_err(|e| to_store_error(e))
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Document>, StoreError> {
        let ids = ids.to_vec();
        let payloads = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT doc_json FROM documents WHERE id = ?1")
                    ?;
                let mut out = Vec::new();
                for id in &ids {
                    let json: Option<String> = stmt
                        .query_row([id], |row| row.get(0))
                        .optional()
                        ?;
                    if let Some(json) = json {
                        out.push(json);
                    }
                }
                Ok::<Vec<String>, tokio_rusqlite::rusqlite::Error>(out)
            })
            .await
            .map_err(|e| to_store_error(e))?;
        payloads
            .iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }
}

struct EntryRow {
    id: String,
    content: String,
    content_hash: String,
    created_at: String,
    updated_at: String,
    subject: Option<String>,
    predicate: Option<String>,
    object: Option<String>,
    meta_json: String,
    tags_json: String,
    refs_json: String,
    dim: usize,
    vector_json: String,
}

fn entry_to_row(entry: &MemoryEntry) -> Result<EntryRow, StoreError> {
    Ok(EntryRow {
        id: entry.id.to_string(),
        content: entry.content.clone(),
        content_hash: entry.content_hash.clone(),
        created_at: entry.created_at.to_rfc3339(),
        updated_at: entry.updated_at.to_rfc3339(),
        subject: entry.subject.clone(),
        predicate: entry.predicate.clone(),
        object: entry.object.clone(),
        meta_json: serde_json::to_string(&entry.metadata)?,
        tags_json: serde_json::to_string(&entry.tags)?,
        refs_json: serde_json::to_string(&entry.document_references)?,
        dim: entry.embedding.len(),
        vector_json: serde_json::to_string(&entry.embedding)?,
    })
}

fn row_to_entry(row: &tokio_rusqlite::rusqlite::Row<'_>) -> tokio_rusqlite::rusqlite::Result<MemoryEntry> {
    use tokio_rusqlite::rusqlite::Error as SqlError;
    use tokio_rusqlite::rusqlite::types::Type;

    let parse = |idx: usize, err: String| SqlError::FromSqlConversionFailure(
        idx,
        Type::Text,
        err.into(),
    );

    let id_raw: String = row.get(0)?;
    let id = Uuid::parse_str(&id_raw).map_err(|e| parse(0, e.to_string()))?;
    let created_raw: String = row.get(3)?;
    let created_at = chrono::DateTime::parse_from_rfc3339(&created_raw)
        .map_err(|e| parse(3, e.to_string()))?
        .with_timezone(&chrono::Utc);
    let updated_raw: String = row.get(4)?;
    let updated_at = chrono::DateTime::parse_from_rfc3339(&updated_raw)
        .map_err(|e| parse(4, e.to_string()))?
        .with_timezone(&chrono::Utc);
    let meta_json: String = row.get(8)?;
    let tags_json: String = row.get(9)?;
    let refs_json: String = row.get(10)?;
    let vector_json: String = row.get(11)?;

    Ok(MemoryEntry {
        id,
        content: row.get(1)?,
        content_hash: row.get(2)?,
        created_at,
        updated_at,
        subject: row.get(5)?,
        predicate: row.get(6)?,
        object: row.get(7)?,
        metadata: serde_json::from_str(&meta_json).map_err(|e| parse(8, e.to_string()))?,
        tags: serde_json::from_str(&tags_json).map_err(|e| parse(9, e.to_string()))?,
        document_references: serde_json::from_str(&refs_json)
            .map_err(|e| parse(10, e.to_string()))?,
        embedding: serde_json::from_str(&vector_json).map_err(|e| parse(11, e.to_string()))?,
    })
}

fn to_store_error(err: impl std::fmt::Display) -> StoreError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("locked") || lowered.contains("busy") {
        StoreError::transient(message)
    } else {
        StoreError::backend(message)
    }
}

/// Register the sqlite-vec extension once per process.
fn register_sqlite_vec() -> Result<(), StoreError> {
    use parking_lot::Mutex;

    static INIT: Once = Once::new();
    static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

    INIT.call_once(|| {
        let result = unsafe {
            type SqliteExtensionInit = unsafe extern "C" fn(
                *mut ffi::sqlite3,
                *mut *mut c_char,
                *const ffi::sqlite3_api_routines,
            ) -> i32;

            let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
            let init_fn: SqliteExtensionInit =
                std::mem::transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
            let rc = ffi::sqlite3_auto_extension(Some(init_fn));
            if rc != 0 {
                Err(format!("failed to register sqlite-vec extension (code {rc})"))
            } else {
                Ok(())
            }
        };
        *INIT_RESULT.lock() = Some(result);
    });

    INIT_RESULT
        .lock()
        .clone()
        .unwrap_or(Err("sqlite-vec init result missing".to_string()))
        .map_err(StoreError::backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Fact;
    use crate::oracle::stub::HashEmbeddingOracle;
    use crate::progress::NullProgress;
    use chrono::Utc;

    const DIM: usize = 32;

    async fn open_store(dir: &tempfile::TempDir) -> SqliteMemoryStore {
        SqliteMemoryStore::open(
            dir.path().join("memory.db"),
            Arc::new(HashEmbeddingOracle::new(DIM)),
            DIM,
        )
        .await
        .unwrap()
    }

    fn entry(content: &str) -> MemoryEntry {
        let chunk = Document::text("t:1#0", "t", Utc::now(), content);
        let fact = Fact::observed_in(&chunk, content);
        MemoryEntry::from_fact(&fact, HashEmbeddingOracle::new(DIM).embed_one(content))
    }

    #[tokio::test]
    async fn round_trip_store_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .store(
                vec![entry("Alice lives in Paris."), entry("Bob plays chess.")],
                &NullProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
        let result = store.query("Alice lives in Paris.", None).await.unwrap();
        assert_eq!(result.entries.len(), 2);
        assert_eq!(result.entries[0].content, "Alice lives in Paris.");
    }

    #[tokio::test]
    async fn update_preserves_created_at_and_delete_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let e = entry("Alice lives in Paris.");
        let id = e.id;
        let created = e.created_at;
        store
            .store(vec![e], &NullProgress, &CancellationToken::new())
            .await
            .unwrap();

        store
            .update(id, MemoryEntryPatch::content("Alice lives in Berlin."))
            .await
            .unwrap();
        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.content, "Alice lives in Berlin.");
        assert_eq!(fetched.created_at.timestamp(), created.timestamp());
        assert!(fetched.updated_at >= fetched.created_at);

        store.delete(id).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn embeddings_are_padded_to_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut e = entry("short vector");
        e.embedding = vec![1.0, 2.0];
        let id = e.id;
        store
            .store(vec![e], &NullProgress, &CancellationToken::new())
            .await
            .unwrap();
        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.embedding.len(), DIM);
    }
}
