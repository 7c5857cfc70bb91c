//! Staged ingestion runs.
//!
//! A run moves one document type through the stage machine
//!
//! ```text
//! FETCHING -> NORMALIZING -> CHUNKING -> DIFFING -> EMBEDDING
//!     -> UPSERTING -> COMMITTING_CURSOR -> DONE
//! ```
//!
//! with `FAILED` reachable from any stage. Malformed records and embedding
//! failures degrade per document; the run only fails outright on structural
//! errors (schema conflict, source unavailable, batch mismatch) or when the
//! failure fraction crosses the configured threshold. The cursor moves only
//! when a run reaches DONE.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RegsmithConfig;
use crate::documents::chunker::{ChunkerConfig, split_text};
use crate::documents::normalize::normalize;
use crate::documents::{ChunkKey, DocumentType, EmbeddedChunk, IndexableChunk, fingerprint};
use crate::embeddings::{EmbeddingLimiter, EmbeddingProvider, RetryPolicy, embed_with_retry};
use crate::ingest::cursor::CursorStore;
use crate::sources::{FetchRange, SourceFetcher};
use crate::stores::IndexManager;
use crate::types::RegError;

/// How much of the upstream corpus a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionMode {
    /// Everything; commits the maximum observed last-modified timestamp.
    Full,
    /// Documents modified after the stored cursor; behaves as `Full` when no
    /// cursor has been committed yet.
    SinceCursor,
    /// Trailing N-day re-check. Never advances the cursor.
    Window { days: i64 },
}

impl std::fmt::Display for IngestionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestionMode::Full => f.write_str("full"),
            IngestionMode::SinceCursor => f.write_str("since_cursor"),
            IngestionMode::Window { days } => write!(f, "window({days}d)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Fetching,
    Normalizing,
    Chunking,
    Diffing,
    Embedding,
    Upserting,
    CommittingCursor,
    Done,
    Failed,
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStage::Fetching => "fetching",
            RunStage::Normalizing => "normalizing",
            RunStage::Chunking => "chunking",
            RunStage::Diffing => "diffing",
            RunStage::Embedding => "embedding",
            RunStage::Upserting => "upserting",
            RunStage::CommittingCursor => "committing_cursor",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Deadline and cancellation for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overall wall-clock budget; exceeding it fails the run with a timeout.
    pub timeout: Option<Duration>,
    /// Cooperative cancellation, checked at stage and batch boundaries.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub fetched: usize,
    pub malformed: usize,
    pub chunks_total: usize,
    pub chunks_skipped: usize,
    pub chunks_embedded: usize,
    pub chunks_failed: usize,
    /// Stale trailing chunks removed after a document shrank.
    pub chunks_removed: usize,
    pub upserted: usize,
}

/// Outcome of one ingestion run, returned whether the run succeeded or
/// failed. `stage` is `Done` or `Failed`; `error` carries the failing stage
/// and cause when `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionReport {
    pub run_id: Uuid,
    pub doc_type: DocumentType,
    pub mode: IngestionMode,
    pub stage: RunStage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counters: RunCounters,
    /// Cursor in effect after the run for full/since-cursor modes; `None`
    /// for window runs and failed runs.
    pub next_cursor: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl IngestionReport {
    pub fn succeeded(&self) -> bool {
        self.stage == RunStage::Done
    }
}

/// Drives ingestion runs over the source, embedding, index, and cursor
/// collaborators.
pub struct IngestionPipeline {
    fetcher: Arc<dyn SourceFetcher>,
    indices: IndexManager,
    embedder: Arc<dyn EmbeddingProvider>,
    limiter: Arc<EmbeddingLimiter>,
    cursors: Arc<dyn CursorStore>,
    chunker: ChunkerConfig,
    retry: RetryPolicy,
    batch_size: usize,
    max_in_flight: usize,
    failure_threshold: f64,
    // Per-type run locks; a second run for the same type waits here.
    locks: parking_lot::Mutex<HashMap<DocumentType, Arc<AsyncMutex<()>>>>,
}

impl IngestionPipeline {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        indices: IndexManager,
        embedder: Arc<dyn EmbeddingProvider>,
        limiter: Arc<EmbeddingLimiter>,
        cursors: Arc<dyn CursorStore>,
        config: &RegsmithConfig,
    ) -> Self {
        Self {
            fetcher,
            indices,
            embedder,
            limiter,
            cursors,
            chunker: config.chunker,
            retry: config.embedding.retry_policy(),
            batch_size: config.embedding.batch_size.max(1),
            max_in_flight: config.embedding.max_in_flight.max(1),
            failure_threshold: config.ingestion.failure_threshold,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, doc_type: DocumentType) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(doc_type).or_default())
    }

    /// Runs one ingestion for a document type. Runs for the same type are
    /// serialized; different types may run concurrently and share the
    /// embedding limiter.
    pub async fn run(
        &self,
        doc_type: DocumentType,
        mode: IngestionMode,
        options: RunOptions,
    ) -> IngestionReport {
        let lock = self.lock_for(doc_type);
        let _guard = lock.lock().await;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, %doc_type, %mode, "ingestion run starting");

        let mut stage = RunStage::Fetching;
        let mut counters = RunCounters::default();
        let outcome = {
            let work = self.run_inner(doc_type, mode, &options.cancel, &mut stage, &mut counters);
            match options.timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_) => Err(RegError::Timeout(limit)),
                },
                None => work.await,
            }
        };
        let finished_at = Utc::now();

        match outcome {
            Ok(next_cursor) => {
                let elapsed = finished_at.signed_duration_since(started_at);
                info!(%run_id, %doc_type, ?counters, elapsed_ms = elapsed.num_milliseconds(),
                    "ingestion run done");
                IngestionReport {
                    run_id,
                    doc_type,
                    mode,
                    stage: RunStage::Done,
                    started_at,
                    finished_at,
                    counters,
                    next_cursor,
                    error: None,
                }
            }
            Err(err) => {
                warn!(%run_id, %doc_type, %stage, error = %err, "ingestion run failed");
                IngestionReport {
                    run_id,
                    doc_type,
                    mode,
                    stage: RunStage::Failed,
                    started_at,
                    finished_at,
                    counters,
                    next_cursor: None,
                    error: Some(format!("{stage}: {err}")),
                }
            }
        }
    }

    async fn run_inner(
        &self,
        doc_type: DocumentType,
        mode: IngestionMode,
        cancel: &CancellationToken,
        stage: &mut RunStage,
        counters: &mut RunCounters,
    ) -> Result<Option<DateTime<Utc>>, RegError> {
        let ensure_active = |cancel: &CancellationToken| {
            if cancel.is_cancelled() {
                Err(RegError::Cancelled)
            } else {
                Ok(())
            }
        };

        // ------------------------------------------------------------------
        // FETCHING
        // ------------------------------------------------------------------
        *stage = RunStage::Fetching;
        ensure_active(cancel)?;
        self.indices.ensure_index(doc_type).await?;

        let previous_cursor = self.cursors.load(doc_type).await?;
        let range = match mode {
            IngestionMode::Full => FetchRange::Full,
            IngestionMode::SinceCursor => match previous_cursor {
                Some(cursor) => FetchRange::Since(cursor),
                None => FetchRange::Full,
            },
            IngestionMode::Window { days } => FetchRange::Window { days },
        };
        let documents = self.fetcher.fetch(doc_type, range).await?;
        counters.fetched = documents.len();

        // ------------------------------------------------------------------
        // NORMALIZING
        // ------------------------------------------------------------------
        *stage = RunStage::Normalizing;
        ensure_active(cancel)?;
        let mut normalized = Vec::with_capacity(documents.len());
        for document in &documents {
            match normalize(document) {
                Ok(doc) => normalized.push(doc),
                Err(err) => {
                    counters.malformed += 1;
                    warn!(%doc_type, source_id = %document.source_id, error = %err,
                        "skipping malformed record");
                }
            }
        }
        if counters.fetched > 0 {
            let fraction = counters.malformed as f64 / counters.fetched as f64;
            if fraction > self.failure_threshold {
                return Err(RegError::SourceUnavailable {
                    doc_type,
                    reason: format!(
                        "{} of {} records malformed",
                        counters.malformed, counters.fetched
                    ),
                });
            }
        }
        let observed_max = normalized.iter().filter_map(|doc| doc.last_modified).max();

        // ------------------------------------------------------------------
        // CHUNKING
        // ------------------------------------------------------------------
        *stage = RunStage::Chunking;
        ensure_active(cancel)?;
        let mut chunks = Vec::new();
        let mut chunk_counts: Vec<(String, u32)> = Vec::with_capacity(normalized.len());
        for doc in &normalized {
            let pieces = split_text(&doc.text, &self.chunker);
            chunk_counts.push((doc.source_id.clone(), pieces.len() as u32));
            for (seq, piece) in pieces.into_iter().enumerate() {
                chunks.push(IndexableChunk {
                    doc_type,
                    key: ChunkKey::new(doc.source_id.clone(), seq as u32),
                    fingerprint: fingerprint(&piece.text),
                    span: piece.span,
                    text: piece.text,
                    metadata: doc.metadata.clone(),
                });
            }
        }
        counters.chunks_total = chunks.len();

        // ------------------------------------------------------------------
        // DIFFING
        // ------------------------------------------------------------------
        *stage = RunStage::Diffing;
        ensure_active(cancel)?;
        let source_ids: Vec<String> = normalized.iter().map(|doc| doc.source_id.clone()).collect();
        let stored = self
            .indices
            .store()
            .stored_fingerprints(doc_type, &source_ids)
            .await?;
        let mut to_embed = Vec::new();
        for chunk in chunks {
            if stored.get(&chunk.key) == Some(&chunk.fingerprint) {
                counters.chunks_skipped += 1;
            } else {
                to_embed.push(chunk);
            }
        }

        // ------------------------------------------------------------------
        // EMBEDDING
        // ------------------------------------------------------------------
        *stage = RunStage::Embedding;
        ensure_active(cancel)?;
        let to_embed_total = to_embed.len();
        let model = self.embedder.model().to_owned();
        let mut embedded: Vec<EmbeddedChunk> = Vec::with_capacity(to_embed_total);

        let mut batches = Vec::new();
        let mut current = Vec::with_capacity(self.batch_size);
        for chunk in to_embed {
            current.push(chunk);
            if current.len() == self.batch_size {
                batches.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }

        let mut in_flight = stream::iter(batches.into_iter().map(|batch| {
            let provider = Arc::clone(&self.embedder);
            let limiter = Arc::clone(&self.limiter);
            let policy = self.retry;
            async move {
                let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
                let result = embed_with_retry(provider.as_ref(), &limiter, &texts, &policy).await;
                (batch, result)
            }
        }))
        .buffer_unordered(self.max_in_flight);

        while let Some((batch, result)) = in_flight.next().await {
            ensure_active(cancel)?;
            match result {
                Ok(vectors) => {
                    counters.chunks_embedded += batch.len();
                    for (chunk, vector) in batch.into_iter().zip(vectors) {
                        embedded.push(EmbeddedChunk {
                            chunk,
                            vector,
                            model: model.clone(),
                        });
                    }
                }
                // Retrying cannot make vector assignment safe, so a length
                // mismatch fails the whole run.
                Err(err @ RegError::EmbeddingBatchMismatch { .. }) => return Err(err),
                Err(err) => {
                    counters.chunks_failed += batch.len();
                    warn!(%doc_type, batch_len = batch.len(), error = %err,
                        "embedding batch failed after retries, chunks deferred");
                }
            }
        }
        drop(in_flight);

        if to_embed_total > 0 {
            let fraction = counters.chunks_failed as f64 / to_embed_total as f64;
            if fraction > self.failure_threshold {
                return Err(RegError::EmbeddingProvider(format!(
                    "{} of {} chunks failed to embed",
                    counters.chunks_failed, to_embed_total
                )));
            }
        }

        // ------------------------------------------------------------------
        // UPSERTING
        // ------------------------------------------------------------------
        *stage = RunStage::Upserting;
        ensure_active(cancel)?;
        counters.upserted = self.indices.store().upsert_chunks(embedded).await?;

        // A document that shrank since its last ingestion leaves chunks with
        // higher sequence numbers behind; drop them so searches stop serving
        // stale text.
        for (source_id, next_seq) in &chunk_counts {
            let has_stale = stored
                .keys()
                .any(|key| &key.source_id == source_id && key.seq >= *next_seq);
            if has_stale {
                let removed = self
                    .indices
                    .store()
                    .delete_chunks_from(doc_type, source_id, *next_seq)
                    .await?;
                counters.chunks_removed += removed;
            }
        }

        // ------------------------------------------------------------------
        // COMMITTING_CURSOR
        // ------------------------------------------------------------------
        *stage = RunStage::CommittingCursor;
        ensure_active(cancel)?;
        match mode {
            // Window runs are a re-check and never move the watermark.
            IngestionMode::Window { .. } => Ok(None),
            IngestionMode::Full | IngestionMode::SinceCursor => {
                match (previous_cursor, observed_max) {
                    (previous, Some(observed))
                        if previous.map(|prev| observed > prev).unwrap_or(true) =>
                    {
                        self.cursors.save(doc_type, observed).await?;
                        Ok(Some(observed))
                    }
                    (previous, _) => Ok(previous),
                }
            }
        }
    }
}
