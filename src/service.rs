//! `CorpusService`, the facade the tool layer talks to.
//!
//! Wires the source, embedding provider, index backend, and cursor store into
//! the ingestion pipeline and the retrieval engine, sharing one embedding
//! limiter between them so the upstream rate limit holds globally.

use std::sync::Arc;

use crate::config::RegsmithConfig;
use crate::documents::DocumentType;
use crate::embeddings::{EmbeddingLimiter, EmbeddingProvider};
use crate::ingest::{
    CursorStore, IngestionMode, IngestionPipeline, IngestionReport, MemoryCursorStore, RunOptions,
};
use crate::retrieval::{RetrievalEngine, SearchRequest, SearchResponse};
use crate::sources::SourceFetcher;
use crate::stores::{IndexManager, MemoryIndex, SearchIndex};
use crate::types::RegError;

/// Builder for [`CorpusService`]. A fetcher and an embedding provider are
/// required; the index backend defaults to [`MemoryIndex`] and the cursor
/// store to [`MemoryCursorStore`].
#[derive(Default)]
pub struct CorpusServiceBuilder {
    config: Option<RegsmithConfig>,
    fetcher: Option<Arc<dyn SourceFetcher>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    store: Option<Arc<dyn SearchIndex>>,
    cursors: Option<Arc<dyn CursorStore>>,
}

impl CorpusServiceBuilder {
    #[must_use]
    pub fn with_config(mut self, config: RegsmithConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SearchIndex>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_cursor_store(mut self, cursors: Arc<dyn CursorStore>) -> Self {
        self.cursors = Some(cursors);
        self
    }

    pub fn build(self) -> Result<CorpusService, RegError> {
        let config = self.config.unwrap_or_default();
        let fetcher = self
            .fetcher
            .ok_or_else(|| RegError::Config("corpus service needs a source fetcher".into()))?;
        let embedder = self
            .embedder
            .ok_or_else(|| RegError::Config("corpus service needs an embedding provider".into()))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryIndex::new()) as Arc<dyn SearchIndex>);
        let cursors = self
            .cursors
            .unwrap_or_else(|| Arc::new(MemoryCursorStore::new()) as Arc<dyn CursorStore>);

        let indices = IndexManager::new(
            Arc::clone(&store),
            config.index_prefix.clone(),
            embedder.model().to_owned(),
            embedder.dimensions(),
        );
        let limiter = Arc::new(EmbeddingLimiter::new(
            config.embedding.max_in_flight,
            config.embedding.min_interval(),
        ));
        let pipeline = IngestionPipeline::new(
            fetcher,
            indices.clone(),
            Arc::clone(&embedder),
            Arc::clone(&limiter),
            cursors,
            &config,
        );
        let retrieval = RetrievalEngine::new(
            indices.clone(),
            embedder,
            limiter,
            config.embedding.retry_policy(),
        );
        Ok(CorpusService {
            config,
            indices,
            pipeline,
            retrieval,
        })
    }
}

pub struct CorpusService {
    config: RegsmithConfig,
    indices: IndexManager,
    pipeline: IngestionPipeline,
    retrieval: RetrievalEngine,
}

impl CorpusService {
    pub fn builder() -> CorpusServiceBuilder {
        CorpusServiceBuilder::default()
    }

    pub fn config(&self) -> &RegsmithConfig {
        &self.config
    }

    /// Window mode over the configured trailing window.
    pub fn default_window_mode(&self) -> IngestionMode {
        IngestionMode::Window {
            days: self.config.ingestion.window_days,
        }
    }

    pub async fn run_ingestion(
        &self,
        doc_type: DocumentType,
        mode: IngestionMode,
        options: RunOptions,
    ) -> IngestionReport {
        self.pipeline.run(doc_type, mode, options).await
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, RegError> {
        self.retrieval.search(request).await
    }

    pub async fn ensure_indices(&self, doc_types: &[DocumentType]) -> Result<(), RegError> {
        self.indices.ensure_indices(doc_types).await
    }

    pub async fn delete_indices(&self, doc_types: &[DocumentType]) -> Result<(), RegError> {
        self.indices.delete_indices(doc_types).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::MockEmbeddingProvider;
    use crate::sources::StaticSource;

    #[test]
    fn builder_requires_fetcher_and_embedder() {
        let err = CorpusService::builder().build().err().unwrap();
        assert!(err.to_string().contains("source fetcher"));

        let err = CorpusService::builder()
            .with_fetcher(Arc::new(StaticSource::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("embedding provider"));

        assert!(
            CorpusService::builder()
                .with_fetcher(Arc::new(StaticSource::new()))
                .with_embedder(Arc::new(MockEmbeddingProvider::new(8)))
                .build()
                .is_ok()
        );
    }
}
