//! Core document model: source records, indexable chunks, and identities.
//!
//! A [`SourceDocument`] is the raw record fetched from an upstream FCA API.
//! Normalization and chunking turn it into one or more [`IndexableChunk`]s,
//! each carrying a composite identity ([`DocumentType`] + [`ChunkKey`]) and a
//! content fingerprint. Embedding attaches a vector, producing the
//! [`EmbeddedChunk`] that is actually persisted and searched.

pub mod chunker;
pub mod normalize;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use chunker::{ChunkerConfig, split_text};
pub use normalize::{NormalizedDocument, normalize};

/// The closed set of document types regsmith ingests.
///
/// Each variant maps to one upstream FCA source and one index. Dispatch is
/// always an exhaustive `match`; adding a variant is a compile-visible
/// change everywhere a type-specific decision is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Handbook,
    PolicyStatement,
    ConsultationPaper,
    Firm,
    EnforcementNotice,
}

impl DocumentType {
    pub const ALL: [DocumentType; 5] = [
        DocumentType::Handbook,
        DocumentType::PolicyStatement,
        DocumentType::ConsultationPaper,
        DocumentType::Firm,
        DocumentType::EnforcementNotice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Handbook => "handbook",
            DocumentType::PolicyStatement => "policy_statement",
            DocumentType::ConsultationPaper => "consultation_paper",
            DocumentType::Firm => "firm",
            DocumentType::EnforcementNotice => "enforcement_notice",
        }
    }

    /// Index name under the configured prefix, e.g. `regsmith_handbook`.
    pub fn index_name(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.as_str())
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentType::ALL
            .iter()
            .copied()
            .find(|doc_type| doc_type.as_str() == s)
            .ok_or_else(|| format!("unknown document type '{s}'"))
    }
}

/// Raw record from an upstream source, immutable once fetched.
///
/// `extra` carries source-specific fields the normalizer folds into the
/// indexable text (firm register endpoints return a dozen sub-resources; the
/// fetcher flattens them here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub doc_type: DocumentType,
    /// Stable identifier within the source: handbook section id, PS/CP
    /// reference, firm reference number, enforcement notice id.
    pub source_id: String,
    pub title: String,
    pub body: String,
    /// Reference number where the type has one (`PS24/1`, `CP24/7`, FRN).
    #[serde(default)]
    pub reference: Option<String>,
    /// Hierarchy path within the source, e.g. `["PRIN", "1", "1.1"]`.
    #[serde(default)]
    pub hierarchy: Vec<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    /// Last-modified timestamp when the source provides one; drives the
    /// incremental cursor.
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl SourceDocument {
    pub fn new(
        doc_type: DocumentType,
        source_id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            doc_type,
            source_id: source_id.into(),
            title: title.into(),
            body: body.into(),
            reference: None,
            hierarchy: Vec::new(),
            published_at: None,
            last_modified: None,
            url: None,
            extra: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    #[must_use]
    pub fn with_hierarchy(mut self, hierarchy: Vec<String>) -> Self {
        self.hierarchy = hierarchy;
        self
    }

    #[must_use]
    pub fn with_last_modified(mut self, ts: DateTime<Utc>) -> Self {
        self.last_modified = Some(ts);
        self
    }

    #[must_use]
    pub fn with_published_at(mut self, ts: DateTime<Utc>) -> Self {
        self.published_at = Some(ts);
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Stable per-document identifier, shared by all chunks of the document.
    ///
    /// Mirrors the upstream URI convention: `handbook_PRIN_1`,
    /// `policy_statement_PS24_1`, `firm_123456`, ...
    pub fn document_uri(&self) -> String {
        document_uri(self.doc_type, &self.source_id)
    }
}

/// Builds the stable document URI for a (type, source id) pair.
pub fn document_uri(doc_type: DocumentType, source_id: &str) -> String {
    format!("{}_{}", doc_type.as_str(), source_id.replace('/', "_"))
}

/// Composite chunk identity within one document type: source identifier plus
/// chunk sequence number. Stable across re-ingestion of unchanged text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub source_id: String,
    pub seq: u32,
}

impl ChunkKey {
    pub fn new(source_id: impl Into<String>, seq: u32) -> Self {
        Self {
            source_id: source_id.into(),
            seq,
        }
    }
}

impl std::fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.source_id, self.seq)
    }
}

/// Parent metadata denormalized onto every chunk so structured filters can be
/// evaluated without a second lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub title: String,
    pub document_uri: String,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub hierarchy: Vec<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub url: Option<String>,
}

impl ChunkMetadata {
    /// Slash-joined hierarchy path used for prefix filtering, e.g. `PRIN/1`.
    pub fn hierarchy_path(&self) -> String {
        self.hierarchy.join("/")
    }
}

/// The unit stored and searched: one bounded passage of one source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexableChunk {
    pub doc_type: DocumentType,
    pub key: ChunkKey,
    pub text: String,
    /// Char offsets of this chunk within the normalized parent text.
    pub span: (usize, usize),
    pub metadata: ChunkMetadata,
    /// Hex SHA-256 of `text`; unchanged fingerprints are skipped on
    /// re-ingestion.
    pub fingerprint: String,
}

/// An [`IndexableChunk`] plus its vector. Invariant: `vector` was computed
/// from exactly `chunk.text` by `model`; a fingerprint change forces
/// re-embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub chunk: IndexableChunk,
    pub vector: Vec<f32>,
    pub model: String,
}

/// Hex SHA-256 content fingerprint of a chunk text.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let a = fingerprint("a firm must conduct its business with integrity");
        let b = fingerprint("a firm must conduct its business with integrity");
        let c = fingerprint("a firm must pay due regard to the interests of its customers");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn document_uri_replaces_reference_slashes() {
        assert_eq!(
            document_uri(DocumentType::PolicyStatement, "PS24/1"),
            "policy_statement_PS24_1"
        );
        assert_eq!(document_uri(DocumentType::Firm, "123456"), "firm_123456");
    }

    #[test]
    fn doc_type_serializes_snake_case() {
        let json = serde_json::to_string(&DocumentType::EnforcementNotice).unwrap();
        assert_eq!(json, "\"enforcement_notice\"");
        assert_eq!(
            DocumentType::ConsultationPaper.index_name("regsmith"),
            "regsmith_consultation_paper"
        );
    }
}
