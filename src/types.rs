//! Shared error taxonomy for ingestion and retrieval.

use std::time::Duration;

use crate::documents::DocumentType;

/// Errors produced by the ingestion pipeline, the index stores, and the
/// retrieval engine.
///
/// The variants follow two propagation rules:
///
/// * **Per-record** errors ([`RegError::MalformedSource`], exhausted embedding
///   retries for a single batch) are absorbed into run counters and never
///   abort an ingestion run on their own.
/// * **Structural** errors ([`RegError::IndexSchemaConflict`],
///   [`RegError::SourceUnavailable`], [`RegError::EmbeddingBatchMismatch`])
///   fail the run and leave the persisted cursor untouched so the next run
///   retries the same window.
#[derive(Debug, thiserror::Error)]
pub enum RegError {
    /// A source record is missing required fields or has an empty text body.
    /// Skippable: the pipeline counts it and moves on.
    #[error("malformed {doc_type} record '{source_id}': {reason}")]
    MalformedSource {
        doc_type: DocumentType,
        source_id: String,
        reason: String,
    },

    /// Transport or auth failure talking to the embedding service. Transient
    /// occurrences are retried with backoff; exhaustion marks the affected
    /// chunks failed for the run.
    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    /// The embedding service returned a vector batch whose length does not
    /// match the input batch. Never retried, never treated as partial
    /// success: misassigning vectors would silently corrupt the index.
    #[error("embedding batch mismatch: sent {sent} texts, received {received} vectors")]
    EmbeddingBatchMismatch { sent: usize, received: usize },

    /// An index already exists with incompatible vector dimensionality or a
    /// different embedding model. Requires explicit delete-and-recreate;
    /// existing vectors are incomparable with the new configuration.
    #[error(
        "index schema conflict for {doc_type}: existing {existing_model}/{existing_dims}d \
         vs requested {requested_model}/{requested_dims}d"
    )]
    IndexSchemaConflict {
        doc_type: DocumentType,
        existing_model: String,
        existing_dims: usize,
        requested_model: String,
        requested_dims: usize,
    },

    /// The upstream source could not be reached or returned garbage. Fatal to
    /// the run; the cursor is not advanced.
    #[error("source unavailable for {doc_type}: {reason}")]
    SourceUnavailable {
        doc_type: DocumentType,
        reason: String,
    },

    /// No index exists for the requested document type. At retrieval time
    /// this degrades a multi-type query to partial results.
    #[error("no index exists for {doc_type}")]
    IndexMissing { doc_type: DocumentType },

    /// Backend storage failure (SQLite, cursor file, ...).
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid or incomplete wiring (missing collaborator, bad setting).
    #[error("configuration error: {0}")]
    Config(String),

    /// The run exceeded the caller-specified timeout.
    #[error("ingestion run timed out after {:?}", .0)]
    Timeout(Duration),

    /// The run was cancelled via its cancellation token.
    #[error("ingestion run cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RegError {
    /// True for errors that abort a run outright rather than degrading a
    /// single document.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            RegError::IndexSchemaConflict { .. }
                | RegError::SourceUnavailable { .. }
                | RegError::EmbeddingBatchMismatch { .. }
                | RegError::Storage(_)
        )
    }
}
