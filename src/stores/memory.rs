//! Deterministic in-process backend.
//!
//! Holds everything in a `RwLock`ed map, scores vectors with exact cosine
//! similarity and keywords with plain term frequency, and breaks score ties
//! by chunk identity. Useful for tests and for offline runs where SQLite is
//! overkill.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::documents::{ChunkKey, DocumentType, EmbeddedChunk};
use crate::types::RegError;

use super::{IndexDefinition, ScoredChunk, SearchFilters, SearchIndex, StoredChunk};

struct MemoryEntry {
    definition: IndexDefinition,
    // BTreeMap keeps scans in chunk-identity order, which is also the
    // tie-break order for equal scores.
    chunks: BTreeMap<ChunkKey, (StoredChunk, Vec<f32>)>,
}

/// In-memory [`SearchIndex`].
#[derive(Default)]
pub struct MemoryIndex {
    indices: RwLock<HashMap<DocumentType, MemoryEntry>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks stored for a document type, zero when the index does
    /// not exist. Test helper.
    pub fn chunk_count(&self, doc_type: DocumentType) -> usize {
        self.indices
            .read()
            .get(&doc_type)
            .map(|entry| entry.chunks.len())
            .unwrap_or(0)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn term_frequency_score(query: &str, text: &str) -> f32 {
    let terms: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(str::to_owned)
        .collect();
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let tokens: Vec<&str> = haystack.split_whitespace().collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let mut hits = 0usize;
    for token in &tokens {
        let token = token.trim_matches(|c: char| !c.is_alphanumeric());
        if terms.iter().any(|term| term == token) {
            hits += 1;
        }
    }
    hits as f32 / tokens.len() as f32
}

/// Stable ordering: score descending, then chunk identity ascending.
fn sort_and_truncate(mut scored: Vec<ScoredChunk>, limit: usize) -> Vec<ScoredChunk> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.key.cmp(&b.chunk.key))
    });
    scored.truncate(limit);
    scored
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn create_index(&self, definition: &IndexDefinition) -> Result<(), RegError> {
        self.indices.write().insert(
            definition.doc_type,
            MemoryEntry {
                definition: definition.clone(),
                chunks: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn get_index(&self, doc_type: DocumentType) -> Result<Option<IndexDefinition>, RegError> {
        Ok(self
            .indices
            .read()
            .get(&doc_type)
            .map(|entry| entry.definition.clone()))
    }

    async fn delete_index(&self, doc_type: DocumentType) -> Result<(), RegError> {
        self.indices.write().remove(&doc_type);
        Ok(())
    }

    async fn upsert_chunks(&self, chunks: Vec<EmbeddedChunk>) -> Result<usize, RegError> {
        let mut indices = self.indices.write();
        let mut written = 0usize;
        for embedded in chunks {
            let entry = indices
                .get_mut(&embedded.chunk.doc_type)
                .ok_or(RegError::IndexMissing {
                    doc_type: embedded.chunk.doc_type,
                })?;
            let stored = StoredChunk {
                doc_type: embedded.chunk.doc_type,
                key: embedded.chunk.key.clone(),
                text: embedded.chunk.text,
                span: embedded.chunk.span,
                fingerprint: embedded.chunk.fingerprint,
                metadata: embedded.chunk.metadata,
                model: embedded.model,
            };
            entry
                .chunks
                .insert(stored.key.clone(), (stored, embedded.vector));
            written += 1;
        }
        Ok(written)
    }

    async fn delete_chunks_from(
        &self,
        doc_type: DocumentType,
        source_id: &str,
        from_seq: u32,
    ) -> Result<usize, RegError> {
        let mut indices = self.indices.write();
        let entry = indices
            .get_mut(&doc_type)
            .ok_or(RegError::IndexMissing { doc_type })?;
        let before = entry.chunks.len();
        entry
            .chunks
            .retain(|key, _| key.source_id != source_id || key.seq < from_seq);
        Ok(before - entry.chunks.len())
    }

    async fn stored_fingerprints(
        &self,
        doc_type: DocumentType,
        source_ids: &[String],
    ) -> Result<HashMap<ChunkKey, String>, RegError> {
        let indices = self.indices.read();
        let entry = indices
            .get(&doc_type)
            .ok_or(RegError::IndexMissing { doc_type })?;
        let mut out = HashMap::new();
        for (key, (stored, _)) in &entry.chunks {
            if source_ids.iter().any(|id| id == &key.source_id) {
                out.insert(key.clone(), stored.fingerprint.clone());
            }
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
        let indices = self.indices.read();
        let entry = indices
            .get(&doc_type)
            .ok_or(RegError::IndexMissing { doc_type })?;
        let scored = entry
            .chunks
            .values()
            .filter(|(stored, _)| filters.matches(&stored.metadata))
            .map(|(stored, vector)| ScoredChunk {
                chunk: stored.clone(),
                score: cosine_similarity(query, vector),
            })
            .collect();
        Ok(sort_and_truncate(scored, limit))
    }

    async fn keyword_search(
        &self,
        doc_type: DocumentType,
        query: Option<&str>,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, RegError> {
        let indices = self.indices.read();
        let entry = indices
            .get(&doc_type)
            .ok_or(RegError::IndexMissing { doc_type })?;
        let scored: Vec<ScoredChunk> = entry
            .chunks
            .values()
            .filter(|(stored, _)| filters.matches(&stored.metadata))
            .filter_map(|(stored, _)| {
                let score = match query {
                    Some(q) => {
                        let s = term_frequency_score(q, &stored.text);
                        if s == 0.0 {
                            return None;
                        }
                        s
                    }
                    // Pure filter scan: every match scores equally and the
                    // identity tie-break decides the order.
                    None => 0.0,
                };
                Some(ScoredChunk {
                    chunk: stored.clone(),
                    score,
                })
            })
            .collect();
        Ok(sort_and_truncate(scored, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{ChunkMetadata, IndexableChunk, fingerprint};

    fn definition(doc_type: DocumentType) -> IndexDefinition {
        IndexDefinition {
            doc_type,
            name: doc_type.index_name("regsmith"),
            model: "mock-model".into(),
            dimensions: 3,
        }
    }

    fn embedded(source_id: &str, seq: u32, text: &str, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: IndexableChunk {
                doc_type: DocumentType::Handbook,
                key: ChunkKey::new(source_id, seq),
                text: text.to_owned(),
                span: (0, text.len()),
                metadata: ChunkMetadata {
                    title: source_id.to_owned(),
                    document_uri: format!("handbook_{source_id}"),
                    ..Default::default()
                },
                fingerprint: fingerprint(text),
            },
            vector,
            model: "mock-model".into(),
        }
    }

    #[tokio::test]
    async fn upsert_without_index_fails() {
        let store = MemoryIndex::new();
        let err = store
            .upsert_chunks(vec![embedded("PRIN_1", 0, "text", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, RegError::IndexMissing { .. }));
    }

    #[tokio::test]
    async fn upsert_overwrites_by_chunk_identity() {
        let store = MemoryIndex::new();
        store
            .create_index(&definition(DocumentType::Handbook))
            .await
            .unwrap();
        store
            .upsert_chunks(vec![embedded("PRIN_1", 0, "old text", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();
        store
            .upsert_chunks(vec![embedded("PRIN_1", 0, "new text", vec![0.0, 1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(store.chunk_count(DocumentType::Handbook), 1);

        let prints = store
            .stored_fingerprints(DocumentType::Handbook, &["PRIN_1".into()])
            .await
            .unwrap();
        assert_eq!(
            prints.get(&ChunkKey::new("PRIN_1", 0)),
            Some(&fingerprint("new text"))
        );
    }

    #[tokio::test]
    async fn vector_search_orders_by_cosine_similarity() {
        let store = MemoryIndex::new();
        store
            .create_index(&definition(DocumentType::Handbook))
            .await
            .unwrap();
        store
            .upsert_chunks(vec![
                embedded("A", 0, "a", vec![1.0, 0.0, 0.0]),
                embedded("B", 0, "b", vec![0.0, 1.0, 0.0]),
                embedded("C", 0, "c", vec![0.9, 0.1, 0.0]),
            ])
            .await
            .unwrap();
        let hits = store
            .vector_search(
                DocumentType::Handbook,
                &[1.0, 0.0, 0.0],
                &SearchFilters::default(),
                2,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.key.source_id, "A");
        assert_eq!(hits[1].chunk.key.source_id, "C");
    }

    #[tokio::test]
    async fn keyword_search_requires_a_hit_and_none_query_scans_filters() {
        let store = MemoryIndex::new();
        store
            .create_index(&definition(DocumentType::Handbook))
            .await
            .unwrap();
        store
            .upsert_chunks(vec![
                embedded("A", 0, "consumer credit rules", vec![1.0, 0.0, 0.0]),
                embedded("B", 0, "prudential capital", vec![0.0, 1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store
            .keyword_search(
                DocumentType::Handbook,
                Some("consumer"),
                &SearchFilters::default(),
                10,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.key.source_id, "A");

        let scan = store
            .keyword_search(DocumentType::Handbook, None, &SearchFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(scan.len(), 2);
        assert_eq!(scan[0].chunk.key.source_id, "A");
        assert_eq!(scan[1].chunk.key.source_id, "B");
    }

    #[tokio::test]
    async fn delete_chunks_from_keeps_earlier_sequences() {
        let store = MemoryIndex::new();
        store
            .create_index(&definition(DocumentType::Handbook))
            .await
            .unwrap();
        store
            .upsert_chunks(vec![
                embedded("CONC", 0, "first", vec![1.0, 0.0, 0.0]),
                embedded("CONC", 1, "second", vec![0.0, 1.0, 0.0]),
                embedded("CONC", 2, "third", vec![0.0, 0.0, 1.0]),
                embedded("OTHER", 0, "elsewhere", vec![1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let removed = store
            .delete_chunks_from(DocumentType::Handbook, "CONC", 1)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.chunk_count(DocumentType::Handbook), 2);

        let prints = store
            .stored_fingerprints(DocumentType::Handbook, &["CONC".into()])
            .await
            .unwrap();
        assert_eq!(prints.len(), 1);
        assert!(prints.contains_key(&ChunkKey::new("CONC", 0)));
    }

    #[tokio::test]
    async fn searches_on_missing_index_fail() {
        let store = MemoryIndex::new();
        let err = store
            .vector_search(
                DocumentType::Firm,
                &[1.0, 0.0, 0.0],
                &SearchFilters::default(),
                5,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegError::IndexMissing {
                doc_type: DocumentType::Firm
            }
        ));
    }
}
