//! SQLite [`SearchIndex`] backend.
//!
//! One database file holds every per-type index. Vectors are scored with
//! `vec_distance_cosine` from the `sqlite-vec` extension; lexical queries run
//! through an FTS5 table ranked by `bm25()`. Structured filters are pushed
//! down into the SQL.

use std::mem::transmute;
use std::os::raw::c_char;
use std::path::Path;
use std::str::FromStr;
use std::sync::Once;

use async_trait::async_trait;
use chrono::SecondsFormat;
use std::collections::HashMap;
use tokio_rusqlite::types::Value;
use tokio_rusqlite::{Connection, OptionalExtension, ffi, params_from_iter};

use crate::documents::{ChunkKey, ChunkMetadata, DocumentType, EmbeddedChunk};
use crate::types::RegError;

use super::{IndexDefinition, ScoredChunk, SearchFilters, SearchIndex, StoredChunk};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS indices (
    doc_type   TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    model      TEXT NOT NULL,
    dimensions INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS chunks (
    id           INTEGER PRIMARY KEY,
    doc_type     TEXT NOT NULL,
    source_id    TEXT NOT NULL,
    seq          INTEGER NOT NULL,
    text         TEXT NOT NULL,
    span_start   INTEGER NOT NULL,
    span_end     INTEGER NOT NULL,
    fingerprint  TEXT NOT NULL,
    metadata     TEXT NOT NULL,
    model        TEXT NOT NULL,
    published_at TEXT,
    reference    TEXT,
    hierarchy    TEXT NOT NULL,
    UNIQUE (doc_type, source_id, seq)
);
CREATE INDEX IF NOT EXISTS idx_chunks_parent ON chunks (doc_type, source_id);
CREATE TABLE IF NOT EXISTS chunk_embeddings (
    chunk_id  INTEGER PRIMARY KEY,
    embedding TEXT NOT NULL
);
CREATE VIRTUAL TABLE IF NOT EXISTS chunk_fts USING fts5(text);
";

/// SQLite-backed search index.
#[derive(Clone)]
pub struct SqliteSearchIndex {
    conn: Connection,
}

/// Row shape prepared outside the connection closure so that serialization
/// errors surface as [`RegError`] rather than driver errors.
struct ChunkRow {
    doc_type: String,
    source_id: String,
    seq: i64,
    text: String,
    span_start: i64,
    span_end: i64,
    fingerprint: String,
    metadata_json: String,
    model: String,
    published_at: Option<String>,
    reference: Option<String>,
    hierarchy: String,
    embedding_json: String,
}

/// Raw search hit before metadata is parsed back out of JSON.
struct RawHit {
    doc_type: String,
    source_id: String,
    seq: i64,
    text: String,
    span_start: i64,
    span_end: i64,
    fingerprint: String,
    metadata_json: String,
    model: String,
    score: f32,
}

impl SqliteSearchIndex {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RegError> {
        Self::register_sqlite_vec()?;
        let conn = Connection::open(path)
            .await
            .map_err(|err| RegError::Storage(err.to_string()))?;
        conn.call(|conn| {
            // Fails fast when the vec extension did not load.
            let result = conn.query_row("select vec_version()", [], |row| row.get::<_, String>(0));
            match result {
                Ok(_) => Ok(()),
                Err(err) => Err(tokio_rusqlite::Error::Rusqlite(err)),
            }
        })
        .await
        .map_err(|err| RegError::Storage(err.to_string()))?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)
                .map_err(tokio_rusqlite::Error::Rusqlite)
        })
        .await
        .map_err(|err| RegError::Storage(err.to_string()))?;
        Ok(Self { conn })
    }

    fn register_sqlite_vec() -> Result<(), RegError> {
        use std::sync::Mutex;

        static INIT: Once = Once::new();
        static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

        INIT.call_once(|| {
            let result = unsafe {
                type SqliteExtensionInit = unsafe extern "C" fn(
                    *mut ffi::sqlite3,
                    *mut *const c_char,
                    *const ffi::sqlite3_api_routines,
                ) -> i32;

                let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
                let init_fn: SqliteExtensionInit =
                    transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
                let rc = ffi::sqlite3_auto_extension(Some(init_fn));
                if rc != 0 {
                    Err(format!(
                        "failed to register sqlite-vec extension (code {rc})"
                    ))
                } else {
                    Ok(())
                }
            };
            *INIT_RESULT.lock().expect("init result mutex poisoned") = Some(result);
        });

        INIT_RESULT
            .lock()
            .expect("init result mutex poisoned")
            .clone()
            .expect("init was called but result not set")
            .map_err(RegError::Storage)
    }

    async fn require_index(&self, doc_type: DocumentType) -> Result<(), RegError> {
        match self.get_index(doc_type).await? {
            Some(_) => Ok(()),
            None => Err(RegError::IndexMissing { doc_type }),
        }
    }

    fn prepare_row(embedded: EmbeddedChunk) -> Result<ChunkRow, RegError> {
        let metadata_json = serde_json::to_string(&embedded.chunk.metadata)
            .map_err(|err| RegError::Storage(err.to_string()))?;
        let embedding_json = serde_json::to_string(&embedded.vector)
            .map_err(|err| RegError::Storage(err.to_string()))?;
        let metadata = &embedded.chunk.metadata;
        Ok(ChunkRow {
            doc_type: embedded.chunk.doc_type.as_str().to_owned(),
            source_id: embedded.chunk.key.source_id.clone(),
            seq: i64::from(embedded.chunk.key.seq),
            span_start: span_bound(embedded.chunk.span.0)?,
            span_end: span_bound(embedded.chunk.span.1)?,
            text: embedded.chunk.text,
            fingerprint: embedded.chunk.fingerprint,
            metadata_json,
            model: embedded.model,
            published_at: metadata
                .published_at
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
            reference: metadata.reference.clone(),
            hierarchy: metadata.hierarchy.join("/"),
            embedding_json,
        })
    }

    fn parse_hit(raw: RawHit) -> Result<ScoredChunk, RegError> {
        let doc_type = DocumentType::from_str(&raw.doc_type).map_err(RegError::Storage)?;
        let metadata: ChunkMetadata = serde_json::from_str(&raw.metadata_json)
            .map_err(|err| RegError::Storage(err.to_string()))?;
        let seq =
            u32::try_from(raw.seq).map_err(|_| RegError::Storage(format!("bad seq {}", raw.seq)))?;
        let span = (span_offset(raw.span_start)?, span_offset(raw.span_end)?);
        Ok(ScoredChunk {
            chunk: StoredChunk {
                doc_type,
                key: ChunkKey::new(raw.source_id, seq),
                text: raw.text,
                span,
                fingerprint: raw.fingerprint,
                metadata,
                model: raw.model,
            },
            score: raw.score,
        })
    }
}

fn span_bound(offset: usize) -> Result<i64, RegError> {
    i64::try_from(offset).map_err(|_| RegError::Storage(format!("span offset {offset} overflows")))
}

fn span_offset(bound: i64) -> Result<usize, RegError> {
    usize::try_from(bound).map_err(|_| RegError::Storage(format!("bad span offset {bound}")))
}

/// Appends pushed-down filter conditions to a WHERE clause already scoped to
/// one doc_type.
fn push_filter_conditions(filters: &SearchFilters, sql: &mut String, params: &mut Vec<Value>) {
    if let Some(after) = filters.published_after {
        sql.push_str(" AND c.published_at IS NOT NULL AND c.published_at >= ?");
        params.push(Value::Text(after.to_rfc3339_opts(SecondsFormat::Secs, true)));
    }
    if let Some(before) = filters.published_before {
        sql.push_str(" AND c.published_at IS NOT NULL AND c.published_at <= ?");
        params.push(Value::Text(
            before.to_rfc3339_opts(SecondsFormat::Secs, true),
        ));
    }
    if let Some(reference) = &filters.reference {
        sql.push_str(" AND c.reference = ?");
        params.push(Value::Text(reference.clone()));
    }
    if !filters.hierarchy_prefix.is_empty() {
        // Match on segment boundaries so `PRIN/1` does not match `PRIN/10`.
        let prefix = filters.hierarchy_prefix.join("/");
        sql.push_str(" AND (c.hierarchy = ? OR c.hierarchy LIKE ?)");
        params.push(Value::Text(prefix.clone()));
        params.push(Value::Text(format!("{prefix}/%")));
    }
}

/// Rewrites a free-text query into an FTS5 OR-query of quoted terms, or
/// `None` when nothing tokenizable remains.
fn fts_match_expr(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .filter_map(|token| {
            let cleaned: String = token.chars().filter(|c| c.is_alphanumeric()).collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(format!("\"{cleaned}\""))
            }
        })
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[async_trait]
impl SearchIndex for SqliteSearchIndex {
    async fn create_index(&self, definition: &IndexDefinition) -> Result<(), RegError> {
        let doc_type = definition.doc_type.as_str().to_owned();
        let name = definition.name.clone();
        let model = definition.model.clone();
        let dimensions = definition.dimensions as i64;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO indices (doc_type, name, model, dimensions) \
                     VALUES (?, ?, ?, ?)",
                    (&doc_type, &name, &model, dimensions),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(|err| RegError::Storage(err.to_string()))
    }

    async fn get_index(&self, doc_type: DocumentType) -> Result<Option<IndexDefinition>, RegError> {
        let key = doc_type.as_str().to_owned();
        let row = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT name, model, dimensions FROM indices WHERE doc_type = ?",
                    [&key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await
            .map_err(|err| RegError::Storage(err.to_string()))?;
        Ok(row.map(|(name, model, dimensions)| IndexDefinition {
            doc_type,
            name,
            model,
            dimensions: dimensions as usize,
        }))
    }

    async fn delete_index(&self, doc_type: DocumentType) -> Result<(), RegError> {
        let key = doc_type.as_str().to_owned();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction().map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute(
                    "DELETE FROM chunk_fts WHERE rowid IN (SELECT id FROM chunks WHERE doc_type = ?)",
                    [&key],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute(
                    "DELETE FROM chunk_embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE doc_type = ?)",
                    [&key],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute("DELETE FROM chunks WHERE doc_type = ?", [&key])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute("DELETE FROM indices WHERE doc_type = ?", [&key])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(|err| RegError::Storage(err.to_string()))
    }

    async fn upsert_chunks(&self, chunks: Vec<EmbeddedChunk>) -> Result<usize, RegError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let mut seen = Vec::new();
        for embedded in &chunks {
            if !seen.contains(&embedded.chunk.doc_type) {
                seen.push(embedded.chunk.doc_type);
            }
        }
        for doc_type in seen {
            self.require_index(doc_type).await?;
        }

        let rows: Vec<ChunkRow> = chunks
            .into_iter()
            .map(Self::prepare_row)
            .collect::<Result<_, _>>()?;
        let count = rows.len();

        self.conn
            .call(move |conn| {
                for row in rows {
                    // Delete-then-insert inside one transaction keeps each
                    // chunk's three rows consistent.
                    let tx = conn.transaction().map_err(tokio_rusqlite::Error::Rusqlite)?;
                    let existing: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM chunks WHERE doc_type = ? AND source_id = ? AND seq = ?",
                            (&row.doc_type, &row.source_id, row.seq),
                            |r| r.get(0),
                        )
                        .optional()
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    if let Some(id) = existing {
                        tx.execute("DELETE FROM chunk_fts WHERE rowid = ?", [id])
                            .map_err(tokio_rusqlite::Error::Rusqlite)?;
                        tx.execute("DELETE FROM chunk_embeddings WHERE chunk_id = ?", [id])
                            .map_err(tokio_rusqlite::Error::Rusqlite)?;
                        tx.execute("DELETE FROM chunks WHERE id = ?", [id])
                            .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    }
                    tx.execute(
                        "INSERT INTO chunks \
                         (doc_type, source_id, seq, text, span_start, span_end, fingerprint, metadata, model, published_at, reference, hierarchy) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                        (
                            &row.doc_type,
                            &row.source_id,
                            row.seq,
                            &row.text,
                            row.span_start,
                            row.span_end,
                            &row.fingerprint,
                            &row.metadata_json,
                            &row.model,
                            &row.published_at,
                            &row.reference,
                            &row.hierarchy,
                        ),
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    let id = tx.last_insert_rowid();
                    tx.execute(
                        "INSERT INTO chunk_fts (rowid, text) VALUES (?, ?)",
                        (id, &row.text),
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    tx.execute(
                        "INSERT INTO chunk_embeddings (chunk_id, embedding) VALUES (?, ?)",
                        (id, &row.embedding_json),
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                }
                Ok(())
            })
            .await
            .map_err(|err| RegError::Storage(err.to_string()))?;
        Ok(count)
    }

    async fn delete_chunks_from(
        &self,
        doc_type: DocumentType,
        source_id: &str,
        from_seq: u32,
    ) -> Result<usize, RegError> {
        self.require_index(doc_type).await?;
        let key = doc_type.as_str().to_owned();
        let source_id = source_id.to_owned();
        let from_seq = i64::from(from_seq);
        let removed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction().map_err(tokio_rusqlite::Error::Rusqlite)?;
                let ids: Vec<i64> = {
                    let mut stmt = tx
                        .prepare(
                            "SELECT id FROM chunks \
                             WHERE doc_type = ? AND source_id = ? AND seq >= ?",
                        )
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    let mapped = stmt
                        .query_map((&key, &source_id, from_seq), |row| row.get(0))
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    let mut ids = Vec::new();
                    for id in mapped {
                        ids.push(id.map_err(tokio_rusqlite::Error::Rusqlite)?);
                    }
                    ids
                };
                for id in &ids {
                    tx.execute("DELETE FROM chunk_fts WHERE rowid = ?", [id])
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    tx.execute("DELETE FROM chunk_embeddings WHERE chunk_id = ?", [id])
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    tx.execute("DELETE FROM chunks WHERE id = ?", [id])
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                }
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(ids.len())
            })
            .await
            .map_err(|err| RegError::Storage(err.to_string()))?;
        Ok(removed)
    }

    async fn stored_fingerprints(
        &self,
        doc_type: DocumentType,
        source_ids: &[String],
    ) -> Result<HashMap<ChunkKey, String>, RegError> {
        self.require_index(doc_type).await?;
        if source_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let key = doc_type.as_str().to_owned();
        let ids: Vec<String> = source_ids.to_vec();
        let rows = self
            .conn
            .call(move |conn| {
                let placeholders = vec!["?"; ids.len()].join(", ");
                let sql = format!(
                    "SELECT source_id, seq, fingerprint FROM chunks \
                     WHERE doc_type = ? AND source_id IN ({placeholders})"
                );
                let mut params: Vec<Value> = Vec::with_capacity(ids.len() + 1);
                params.push(Value::Text(key));
                params.extend(ids.into_iter().map(Value::Text));
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mapped = stmt
                    .query_map(params_from_iter(params), |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut out = Vec::new();
                for row in mapped {
                    out.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(out)
            })
            .await
            .map_err(|err| RegError::Storage(err.to_string()))?;
        let mut out = HashMap::with_capacity(rows.len());
        for (source_id, seq, fingerprint) in rows {
            let seq =
                u32::try_from(seq).map_err(|_| RegError::Storage(format!("bad seq {seq}")))?;
            out.insert(ChunkKey::new(source_id, seq), fingerprint);
        }
        Ok(out)
    }

    async fn vector_search(
        &self,
        doc_type: DocumentType,
        query: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, RegError> {
        self.require_index(doc_type).await?;
        let embedding_json =
            serde_json::to_string(query).map_err(|err| RegError::Storage(err.to_string()))?;
        let mut sql = String::from(
            "SELECT c.doc_type, c.source_id, c.seq, c.text, c.span_start, c.span_end, c.fingerprint, c.metadata, c.model, \
             vec_distance_cosine(vec_f32(e.embedding), vec_f32(?)) AS distance \
             FROM chunks c JOIN chunk_embeddings e ON c.id = e.chunk_id \
             WHERE c.doc_type = ?",
        );
        let mut params: Vec<Value> = vec![
            Value::Text(embedding_json),
            Value::Text(doc_type.as_str().to_owned()),
        ];
        push_filter_conditions(filters, &mut sql, &mut params);
        sql.push_str(" ORDER BY distance ASC, c.source_id ASC, c.seq ASC LIMIT ?");
        params.push(Value::Integer(limit as i64));

        let raw = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mapped = stmt
                    .query_map(params_from_iter(params), |row| {
                        let distance: f32 = row.get(9)?;
                        Ok(RawHit {
                            doc_type: row.get(0)?,
                            source_id: row.get(1)?,
                            seq: row.get(2)?,
                            text: row.get(3)?,
                            span_start: row.get(4)?,
                            span_end: row.get(5)?,
                            fingerprint: row.get(6)?,
                            metadata_json: row.get(7)?,
                            model: row.get(8)?,
                            score: 1.0 - distance,
                        })
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut out = Vec::new();
                for row in mapped {
                    out.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(out)
            })
            .await
            .map_err(|err| RegError::Storage(err.to_string()))?;
        raw.into_iter().map(Self::parse_hit).collect()
    }

    async fn keyword_search(
        &self,
        doc_type: DocumentType,
        query: Option<&str>,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, RegError> {
        self.require_index(doc_type).await?;
        let match_expr = query.and_then(fts_match_expr);

        let (sql, params) = match match_expr {
            Some(expr) => {
                let mut sql = String::from(
                    "SELECT c.doc_type, c.source_id, c.seq, c.text, c.span_start, c.span_end, c.fingerprint, c.metadata, c.model, \
                     bm25(chunk_fts) AS rank \
                     FROM chunk_fts JOIN chunks c ON c.id = chunk_fts.rowid \
                     WHERE chunk_fts MATCH ? AND c.doc_type = ?",
                );
                let mut params = vec![
                    Value::Text(expr),
                    Value::Text(doc_type.as_str().to_owned()),
                ];
                push_filter_conditions(filters, &mut sql, &mut params);
                sql.push_str(" ORDER BY rank ASC, c.source_id ASC, c.seq ASC LIMIT ?");
                params.push(Value::Integer(limit as i64));
                (sql, params)
            }
            // Blank query: deterministic filter scan in identity order.
            None => {
                let mut sql = String::from(
                    "SELECT c.doc_type, c.source_id, c.seq, c.text, c.span_start, c.span_end, c.fingerprint, c.metadata, c.model, \
                     0.0 AS rank \
                     FROM chunks c WHERE c.doc_type = ?",
                );
                let mut params = vec![Value::Text(doc_type.as_str().to_owned())];
                push_filter_conditions(filters, &mut sql, &mut params);
                sql.push_str(" ORDER BY c.source_id ASC, c.seq ASC LIMIT ?");
                params.push(Value::Integer(limit as i64));
                (sql, params)
            }
        };

        let raw = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mapped = stmt
                    .query_map(params_from_iter(params), |row| {
                        let rank: f64 = row.get(9)?;
                        Ok(RawHit {
                            doc_type: row.get(0)?,
                            source_id: row.get(1)?,
                            seq: row.get(2)?,
                            text: row.get(3)?,
                            span_start: row.get(4)?,
                            span_end: row.get(5)?,
                            fingerprint: row.get(6)?,
                            metadata_json: row.get(7)?,
                            model: row.get(8)?,
                            // bm25() returns lower-is-better; flip so callers
                            // always sort descending.
                            score: -(rank as f32),
                        })
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut out = Vec::new();
                for row in mapped {
                    out.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(out)
            })
            .await
            .map_err(|err| RegError::Storage(err.to_string()))?;
        raw.into_iter().map(Self::parse_hit).collect()
    }
}
