//! ```text
//! SourceFetcher ──► ingest::pipeline ──┬─► documents::normalize
//!                                      ├─► documents::chunker ──► fingerprints
//!                                      ├─► embeddings (batched, rate-limited)
//!                                      └─► stores (per-type indices)
//!                        │
//!                        └─► ingest::cursor (committed only at DONE)
//!
//! Query ──► retrieval::RetrievalEngine ──► vector + keyword searches
//!                        │                     per document type
//!                        └─► reciprocal-rank fusion ──► SearchResponse
//!
//! service::CorpusService wires both paths behind one facade.
//! ```
//!
pub mod config;
pub mod documents;
pub mod embeddings;
pub mod ingest;
pub mod retrieval;
pub mod service;
pub mod sources;
pub mod stores;
pub mod types;

pub use config::RegsmithConfig;
pub use documents::{ChunkKey, DocumentType, SourceDocument};
pub use ingest::{IngestionMode, IngestionReport, RunOptions, RunStage};
pub use retrieval::{SearchRequest, SearchResponse};
pub use service::{CorpusService, CorpusServiceBuilder};
pub use types::RegError;
