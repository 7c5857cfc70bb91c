//! Index store seam and the index manager built on top of it.
//!
//! [`SearchIndex`] is the interface of the external search/index store
//! collaborator: named per-type indices holding embedded chunks with both a
//! vector side and a lexical/filter side. Two backends ship:
//!
//! * [`memory::MemoryIndex`] — deterministic in-process backend for tests and
//!   offline runs.
//! * [`sqlite::SqliteSearchIndex`] — SQLite with cosine distance via
//!   `sqlite-vec` and lexical matching via FTS5.
//!
//! [`IndexManager`] owns the per-type [`IndexDefinition`]s and implements the
//! lifecycle rules: idempotent create, schema-conflict detection (never
//! auto-migrate), idempotent delete.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::documents::{ChunkKey, ChunkMetadata, DocumentType, EmbeddedChunk};
use crate::types::RegError;

pub use memory::MemoryIndex;
pub use sqlite::SqliteSearchIndex;

/// Per-document-type index configuration.
///
/// Dimensionality is fixed at the embedding model's output size. A model or
/// dimensionality change makes existing vectors incomparable, so the index
/// must be deleted and recreated rather than altered in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub doc_type: DocumentType,
    pub name: String,
    pub model: String,
    pub dimensions: usize,
}

impl IndexDefinition {
    /// True when an existing index can serve vectors produced under `other`.
    pub fn is_compatible(&self, other: &IndexDefinition) -> bool {
        self.model == other.model && self.dimensions == other.dimensions
    }
}

/// Structured filters evaluated against denormalized chunk metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub published_after: Option<DateTime<Utc>>,
    pub published_before: Option<DateTime<Utc>>,
    /// Exact reference number match (`PS24/1`, FRN, notice id).
    pub reference: Option<String>,
    /// Hierarchy path prefix, e.g. `["PRIN"]` matches `PRIN/1/1.2`.
    pub hierarchy_prefix: Vec<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.published_after.is_none()
            && self.published_before.is_none()
            && self.reference.is_none()
            && self.hierarchy_prefix.is_empty()
    }

    /// In-process evaluation; backends may instead push these down.
    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        if let Some(after) = self.published_after {
            match metadata.published_at {
                Some(ts) if ts >= after => {}
                _ => return false,
            }
        }
        if let Some(before) = self.published_before {
            match metadata.published_at {
                Some(ts) if ts <= before => {}
                _ => return false,
            }
        }
        if let Some(reference) = &self.reference {
            if metadata.reference.as_deref() != Some(reference.as_str()) {
                return false;
            }
        }
        if !self.hierarchy_prefix.is_empty() {
            if metadata.hierarchy.len() < self.hierarchy_prefix.len() {
                return false;
            }
            let matches = metadata
                .hierarchy
                .iter()
                .zip(&self.hierarchy_prefix)
                .all(|(have, want)| have == want);
            if !matches {
                return false;
            }
        }
        true
    }
}

/// A chunk as persisted by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunk {
    pub doc_type: DocumentType,
    pub key: ChunkKey,
    pub text: String,
    /// Char offsets of this chunk within the normalized parent text.
    pub span: (usize, usize),
    pub fingerprint: String,
    pub metadata: ChunkMetadata,
    pub model: String,
}

/// A stored chunk plus a backend-specific relevance score (higher is
/// better). The retrieval engine only relies on the ordering, not the
/// magnitude.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: StoredChunk,
    pub score: f32,
}

/// External search/index store collaborator.
///
/// All operations address one named per-type index. Search and upsert
/// operations on an index that does not exist fail with
/// [`RegError::IndexMissing`].
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Creates an index from a definition. Plain create; idempotency and
    /// conflict detection live in [`IndexManager`].
    async fn create_index(&self, definition: &IndexDefinition) -> Result<(), RegError>;

    /// The definition of an existing index, or `None`.
    async fn get_index(&self, doc_type: DocumentType) -> Result<Option<IndexDefinition>, RegError>;

    /// Removes the index and everything in it. Idempotent.
    async fn delete_index(&self, doc_type: DocumentType) -> Result<(), RegError>;

    /// Writes or overwrites chunks by composite identity. Each chunk lands
    /// with all fields or not at all. Returns the number written.
    async fn upsert_chunks(&self, chunks: Vec<EmbeddedChunk>) -> Result<usize, RegError>;

    /// Removes every chunk of one parent document whose `seq` is at or past
    /// `from_seq`. Used after re-ingesting a document that shrank, so stale
    /// trailing chunks do not linger in search results. Returns the number
    /// removed.
    async fn delete_chunks_from(
        &self,
        doc_type: DocumentType,
        source_id: &str,
        from_seq: u32,
    ) -> Result<usize, RegError>;

    /// Fingerprints currently stored for the given parent documents, keyed by
    /// chunk identity. Used by the ingestion diff; an empty map is returned
    /// for an index that exists but holds none of the documents.
    async fn stored_fingerprints(
        &self,
        doc_type: DocumentType,
        source_ids: &[String],
    ) -> Result<HashMap<ChunkKey, String>, RegError>;

    /// Vector-similarity search, best first.
    async fn vector_search(
        &self,
        doc_type: DocumentType,
        query: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, RegError>;

    /// Lexical search plus structured filters, best first. A `None` query
    /// degrades to a pure filter scan with deterministic ordering.
    async fn keyword_search(
        &self,
        doc_type: DocumentType,
        query: Option<&str>,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, RegError>;
}

/// Owns index definitions and lifecycle on top of a [`SearchIndex`] backend.
#[derive(Clone)]
pub struct IndexManager {
    store: Arc<dyn SearchIndex>,
    index_prefix: String,
    model: String,
    dimensions: usize,
}

impl IndexManager {
    pub fn new(
        store: Arc<dyn SearchIndex>,
        index_prefix: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            store,
            index_prefix: index_prefix.into(),
            model: model.into(),
            dimensions,
        }
    }

    pub fn store(&self) -> &Arc<dyn SearchIndex> {
        &self.store
    }

    /// The definition this manager would create for a document type.
    pub fn definition_for(&self, doc_type: DocumentType) -> IndexDefinition {
        IndexDefinition {
            doc_type,
            name: doc_type.index_name(&self.index_prefix),
            model: self.model.clone(),
            dimensions: self.dimensions,
        }
    }

    /// Idempotent create. No-op when a compatible index exists; fails with
    /// [`RegError::IndexSchemaConflict`] when an existing index has a
    /// different model or dimensionality.
    pub async fn ensure_index(&self, doc_type: DocumentType) -> Result<(), RegError> {
        let wanted = self.definition_for(doc_type);
        match self.store.get_index(doc_type).await? {
            Some(existing) if existing.is_compatible(&wanted) => Ok(()),
            Some(existing) => Err(RegError::IndexSchemaConflict {
                doc_type,
                existing_model: existing.model,
                existing_dims: existing.dimensions,
                requested_model: wanted.model,
                requested_dims: wanted.dimensions,
            }),
            None => {
                info!(%doc_type, index = %wanted.name, dims = wanted.dimensions, "creating index");
                self.store.create_index(&wanted).await
            }
        }
    }

    /// Idempotent delete: absent indices are not an error.
    pub async fn delete_index(&self, doc_type: DocumentType) -> Result<(), RegError> {
        self.store.delete_index(doc_type).await
    }

    pub async fn ensure_indices(&self, doc_types: &[DocumentType]) -> Result<(), RegError> {
        for doc_type in doc_types {
            self.ensure_index(*doc_type).await?;
        }
        Ok(())
    }

    pub async fn delete_indices(&self, doc_types: &[DocumentType]) -> Result<(), RegError> {
        for doc_type in doc_types {
            self.delete_index(*doc_type).await?;
        }
        Ok(())
    }
}
