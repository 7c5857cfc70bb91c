//! Upstream source seam.
//!
//! The raw HTTP clients for the FCA register, handbook, and publication feeds
//! live behind [`SourceFetcher`]; the pipeline only sees parsed
//! [`SourceDocument`]s. [`StaticSource`] is the fixture implementation used
//! in tests and offline runs.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::documents::{DocumentType, SourceDocument};
use crate::types::RegError;

/// What slice of the upstream corpus an ingestion run wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchRange {
    /// The entire corpus for the document type.
    Full,
    /// Documents modified strictly after the given cursor timestamp.
    Since(DateTime<Utc>),
    /// Documents modified within the trailing window, regardless of cursor.
    Window { days: i64 },
}

/// Fetches parsed records for one document type.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// May fail with [`RegError::SourceUnavailable`], which fails the run
    /// without advancing the cursor.
    async fn fetch(
        &self,
        doc_type: DocumentType,
        range: FetchRange,
    ) -> Result<Vec<SourceDocument>, RegError>;
}

/// In-memory source backed by a fixed set of documents.
///
/// Range filtering matches the live sources: `Since` compares strictly
/// against `last_modified`, `Window` takes the trailing N days up to now, and
/// documents without a last-modified timestamp only appear in full fetches.
#[derive(Default)]
pub struct StaticSource {
    documents: RwLock<HashMap<DocumentType, Vec<SourceDocument>>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the fixture set for a document type.
    pub fn set_documents(&self, doc_type: DocumentType, documents: Vec<SourceDocument>) {
        self.documents.write().insert(doc_type, documents);
    }

    /// Inserts or replaces a single document by source id, bumping nothing
    /// else — the way an upstream edit shows up between runs.
    pub fn upsert_document(&self, document: SourceDocument) {
        let mut guard = self.documents.write();
        let entries = guard.entry(document.doc_type).or_default();
        if let Some(existing) = entries
            .iter_mut()
            .find(|existing| existing.source_id == document.source_id)
        {
            *existing = document;
        } else {
            entries.push(document);
        }
    }
}

#[async_trait]
impl SourceFetcher for StaticSource {
    async fn fetch(
        &self,
        doc_type: DocumentType,
        range: FetchRange,
    ) -> Result<Vec<SourceDocument>, RegError> {
        let guard = self.documents.read();
        let all = guard.get(&doc_type).cloned().unwrap_or_default();
        let filtered = match range {
            FetchRange::Full => all,
            FetchRange::Since(cursor) => all
                .into_iter()
                .filter(|doc| doc.last_modified.is_some_and(|ts| ts > cursor))
                .collect(),
            FetchRange::Window { days } => {
                let floor = Utc::now() - Duration::days(days.max(0));
                all.into_iter()
                    .filter(|doc| doc.last_modified.is_some_and(|ts| ts >= floor))
                    .collect()
            }
        };
        Ok(filtered)
    }
}

/// Fetcher double that always fails, for exercising the structural-error
/// path.
pub struct UnavailableSource;

#[async_trait]
impl SourceFetcher for UnavailableSource {
    async fn fetch(
        &self,
        doc_type: DocumentType,
        _range: FetchRange,
    ) -> Result<Vec<SourceDocument>, RegError> {
        Err(RegError::SourceUnavailable {
            doc_type,
            reason: "upstream offline".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn doc(id: &str, modified_days_ago: i64) -> SourceDocument {
        SourceDocument::new(DocumentType::Handbook, id, "Title", "Body text.")
            .with_last_modified(Utc::now() - Duration::days(modified_days_ago))
    }

    #[tokio::test]
    async fn since_filters_strictly_after_cursor() {
        let source = StaticSource::new();
        let cursor = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();
        let older = SourceDocument::new(DocumentType::Handbook, "old", "t", "b")
            .with_last_modified(cursor);
        let newer = SourceDocument::new(DocumentType::Handbook, "new", "t", "b")
            .with_last_modified(cursor + Duration::hours(1));
        source.set_documents(DocumentType::Handbook, vec![older, newer]);

        let fetched = source
            .fetch(DocumentType::Handbook, FetchRange::Since(cursor))
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].source_id, "new");
    }

    #[tokio::test]
    async fn window_takes_trailing_days() {
        let source = StaticSource::new();
        source.set_documents(
            DocumentType::Handbook,
            vec![doc("recent", 2), doc("stale", 30)],
        );

        let fetched = source
            .fetch(DocumentType::Handbook, FetchRange::Window { days: 7 })
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].source_id, "recent");
    }

    #[tokio::test]
    async fn upsert_replaces_by_source_id() {
        let source = StaticSource::new();
        source.upsert_document(doc("PRIN_1", 1));
        let mut updated = doc("PRIN_1", 0);
        updated.body = "Updated body.".to_string();
        source.upsert_document(updated);

        let fetched = source
            .fetch(DocumentType::Handbook, FetchRange::Full)
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].body, "Updated body.");
    }
}
