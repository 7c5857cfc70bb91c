//! Hybrid retrieval over the per-type indices.
//!
//! One query fans out to vector and keyword searches per requested document
//! type; the per-type result lists are merged by reciprocal-rank fusion with
//! a deterministic identity tie-break. A type whose index is missing or whose
//! backend errors is reported in `SearchResponse::unavailable` instead of
//! failing the whole query.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::documents::{ChunkKey, ChunkMetadata, DocumentType};
use crate::embeddings::{EmbeddingLimiter, EmbeddingProvider, RetryPolicy, embed_with_retry};
use crate::stores::{IndexManager, ScoredChunk, SearchFilters};
use crate::types::RegError;

/// Rank constant for reciprocal-rank fusion. The conventional value; large
/// enough that appearing in both lists beats a single top rank.
const RRF_K: f64 = 60.0;

/// How many candidates each list contributes per type, as a multiple of the
/// requested limit.
const CANDIDATE_MULTIPLIER: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Free-text query. Blank means pure filter scan: no embedding call, no
    /// vector scoring.
    pub query: String,
    /// Types to search; empty means all.
    #[serde(default)]
    pub doc_types: Vec<DocumentType>,
    #[serde(default)]
    pub filters: SearchFilters,
    pub limit: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, limit: usize) -> Self {
        Self {
            query: query.into(),
            doc_types: Vec::new(),
            filters: SearchFilters::default(),
            limit,
        }
    }

    #[must_use]
    pub fn with_doc_types(mut self, doc_types: Vec<DocumentType>) -> Self {
        self.doc_types = doc_types;
        self
    }

    #[must_use]
    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }
}

/// One chunk-granularity hit. Parent documents are not deduplicated; callers
/// group by `metadata.document_uri` when they want documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedHit {
    pub doc_type: DocumentType,
    pub key: ChunkKey,
    pub text: String,
    /// Char offsets of the chunk within its normalized parent text.
    pub span: (usize, usize),
    pub metadata: ChunkMetadata,
    /// Fused reciprocal-rank score; comparable only within one response.
    pub score: f64,
}

/// A document type the query could not cover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexOutage {
    pub doc_type: DocumentType,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Vec<RankedHit>,
    /// Types skipped because their index is missing or their backend failed.
    /// Non-empty `unavailable` with non-empty `hits` is a partial answer.
    pub unavailable: Vec<IndexOutage>,
}

/// Fans a query out across per-type indices and fuses the results.
pub struct RetrievalEngine {
    indices: IndexManager,
    embedder: Arc<dyn EmbeddingProvider>,
    limiter: Arc<EmbeddingLimiter>,
    retry: RetryPolicy,
}

impl RetrievalEngine {
    pub fn new(
        indices: IndexManager,
        embedder: Arc<dyn EmbeddingProvider>,
        limiter: Arc<EmbeddingLimiter>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            indices,
            embedder,
            limiter,
            retry,
        }
    }

    /// Runs one hybrid search.
    ///
    /// Fails outright only when the query itself cannot be embedded; per-type
    /// backend trouble degrades to `unavailable` entries.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, RegError> {
        if request.limit == 0 {
            return Ok(SearchResponse::default());
        }
        let doc_types: Vec<DocumentType> = if request.doc_types.is_empty() {
            DocumentType::ALL.to_vec()
        } else {
            request.doc_types.clone()
        };

        let query = request.query.trim();
        let query_vector = if query.is_empty() {
            None
        } else {
            let texts = vec![query.to_owned()];
            let mut vectors =
                embed_with_retry(self.embedder.as_ref(), &self.limiter, &texts, &self.retry)
                    .await?;
            // embed_with_retry guarantees one vector per input text.
            vectors.pop()
        };

        let depth = request.limit.saturating_mul(CANDIDATE_MULTIPLIER);
        let store = self.indices.store();
        let mut lists: Vec<Vec<ScoredChunk>> = Vec::new();
        let mut unavailable = Vec::new();

        for doc_type in doc_types {
            let outcome = async {
                let mut per_type = Vec::new();
                if let Some(vector) = &query_vector {
                    per_type.push(
                        store
                            .vector_search(doc_type, vector, &request.filters, depth)
                            .await?,
                    );
                }
                let text_query = if query.is_empty() { None } else { Some(query) };
                per_type.push(
                    store
                        .keyword_search(doc_type, text_query, &request.filters, depth)
                        .await?,
                );
                Ok::<_, RegError>(per_type)
            }
            .await;

            match outcome {
                Ok(per_type) => lists.extend(per_type),
                Err(err) => {
                    warn!(%doc_type, error = %err, "document type unavailable for query");
                    unavailable.push(IndexOutage {
                        doc_type,
                        reason: err.to_string(),
                    });
                }
            }
        }

        let mut hits = fuse(&lists);
        hits.truncate(request.limit);
        debug!(
            hits = hits.len(),
            unavailable = unavailable.len(),
            "search complete"
        );
        Ok(SearchResponse { hits, unavailable })
    }
}

/// Reciprocal-rank fusion across result lists, best first.
///
/// Each list contributes `1 / (k + rank)` per chunk (rank starting at 1);
/// equal fused scores fall back to chunk identity so repeated queries return
/// the same order.
fn fuse(lists: &[Vec<ScoredChunk>]) -> Vec<RankedHit> {
    let mut fused: BTreeMap<(DocumentType, ChunkKey), (f64, &ScoredChunk)> = BTreeMap::new();
    for list in lists {
        for (position, scored) in list.iter().enumerate() {
            let contribution = 1.0 / (RRF_K + (position + 1) as f64);
            let identity = (scored.chunk.doc_type, scored.chunk.key.clone());
            fused
                .entry(identity)
                .and_modify(|(score, _)| *score += contribution)
                .or_insert((contribution, scored));
        }
    }

    let mut ranked: Vec<(f64, &ScoredChunk)> = fused.into_values().collect();
    ranked.sort_by(|(score_a, chunk_a), (score_b, chunk_b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                (chunk_a.chunk.doc_type, &chunk_a.chunk.key)
                    .cmp(&(chunk_b.chunk.doc_type, &chunk_b.chunk.key))
            })
    });
    ranked
        .into_iter()
        .map(|(score, scored)| RankedHit {
            doc_type: scored.chunk.doc_type,
            key: scored.chunk.key.clone(),
            text: scored.chunk.text.clone(),
            span: scored.chunk.span,
            metadata: scored.chunk.metadata.clone(),
            score,
        })
        .collect()
}
