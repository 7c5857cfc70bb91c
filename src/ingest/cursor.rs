//! Cursor persistence for incremental ingestion.
//!
//! One cursor per document type: the highest `last_modified` timestamp
//! committed by a completed run. The pipeline reads it at FETCHING and writes
//! it only at COMMITTING_CURSOR, so a failed run never moves it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::documents::DocumentType;
use crate::types::RegError;

#[async_trait]
pub trait CursorStore: Send + Sync {
    /// The committed high-watermark for a document type, if any run has
    /// completed.
    async fn load(&self, doc_type: DocumentType) -> Result<Option<DateTime<Utc>>, RegError>;

    /// Atomically replaces the cursor. Must be durable before returning.
    async fn save(&self, doc_type: DocumentType, cursor: DateTime<Utc>) -> Result<(), RegError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorFile {
    doc_type: DocumentType,
    last_modified: DateTime<Utc>,
    committed_at: DateTime<Utc>,
}

/// File-backed [`CursorStore`], one JSON file per document type.
///
/// Writes go through a temp file and a rename so a crash mid-save leaves the
/// previous cursor intact.
#[derive(Clone, Debug)]
pub struct FileCursorStore {
    dir: PathBuf,
}

impl FileCursorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, doc_type: DocumentType) -> PathBuf {
        self.dir.join(format!("{}.cursor.json", doc_type.as_str()))
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, doc_type: DocumentType) -> Result<Option<DateTime<Utc>>, RegError> {
        let path = self.path_for(doc_type);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path).await?;
        let file: CursorFile =
            serde_json::from_str(&data).map_err(|err| RegError::Storage(err.to_string()))?;
        Ok(Some(file.last_modified))
    }

    async fn save(&self, doc_type: DocumentType, cursor: DateTime<Utc>) -> Result<(), RegError> {
        fs::create_dir_all(&self.dir).await?;
        let file = CursorFile {
            doc_type,
            last_modified: cursor,
            committed_at: Utc::now(),
        };
        let serialized = serde_json::to_string_pretty(&file)
            .map_err(|err| RegError::Storage(err.to_string()))?;
        let path = self.path_for(doc_type);
        let tmp = self.dir.join(format!(".{}.cursor.tmp", doc_type.as_str()));
        fs::write(&tmp, serialized).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// In-memory [`CursorStore`] for tests.
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: RwLock<HashMap<DocumentType, DateTime<Utc>>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, doc_type: DocumentType) -> Result<Option<DateTime<Utc>>, RegError> {
        Ok(self.cursors.read().get(&doc_type).copied())
    }

    async fn save(&self, doc_type: DocumentType, cursor: DateTime<Utc>) -> Result<(), RegError> {
        self.cursors.write().insert(doc_type, cursor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_cursor_round_trips_per_type() {
        let dir = tempdir().unwrap();
        let store = FileCursorStore::new(dir.path());

        assert!(store.load(DocumentType::Handbook).await.unwrap().is_none());

        let handbook_cursor = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        store
            .save(DocumentType::Handbook, handbook_cursor)
            .await
            .unwrap();
        assert_eq!(
            store.load(DocumentType::Handbook).await.unwrap(),
            Some(handbook_cursor)
        );
        // Other types are untouched.
        assert!(store.load(DocumentType::Firm).await.unwrap().is_none());

        // A fresh handle over the same directory sees the committed value.
        let reopened = FileCursorStore::new(dir.path());
        assert_eq!(
            reopened.load(DocumentType::Handbook).await.unwrap(),
            Some(handbook_cursor)
        );
    }

    #[tokio::test]
    async fn save_replaces_previous_cursor() {
        let dir = tempdir().unwrap();
        let store = FileCursorStore::new(dir.path());
        let first = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        store.save(DocumentType::Firm, first).await.unwrap();
        store.save(DocumentType::Firm, second).await.unwrap();
        assert_eq!(store.load(DocumentType::Firm).await.unwrap(), Some(second));
    }
}
