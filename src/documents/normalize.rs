//! Per-type normalization of upstream records into chunkable documents.
//!
//! Each [`DocumentType`] has its own validation and text assembly, dispatched
//! by exhaustive `match`. Normalization is deterministic: the same
//! [`SourceDocument`] always yields the same output regardless of run order.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::documents::{ChunkMetadata, DocumentType, SourceDocument};
use crate::types::RegError;

static PS_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^ps\d+/\d+$").expect("valid regex"));
static CP_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^cp\d+/\d+$").expect("valid regex"));
// Firm reference numbers are 6 or 7 digits on the register.
static FRN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{6,7}$").expect("valid regex"));

/// One source document reduced to the text and metadata the chunker needs.
#[derive(Debug, Clone)]
pub struct NormalizedDocument {
    pub doc_type: DocumentType,
    pub source_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Validates and normalizes one source record.
///
/// Returns [`RegError::MalformedSource`] when required fields are absent or
/// the text body is empty; the pipeline logs and skips such records without
/// aborting the run.
pub fn normalize(doc: &SourceDocument) -> Result<NormalizedDocument, RegError> {
    let source_id = doc.source_id.trim();
    if source_id.is_empty() {
        return Err(malformed(doc, "missing source identifier"));
    }
    if doc.body.trim().is_empty() {
        return Err(malformed(doc, "empty text body"));
    }

    let reference = doc
        .reference
        .as_deref()
        .or(Some(source_id))
        .map(str::trim)
        .map(str::to_string);

    match doc.doc_type {
        DocumentType::Handbook => {}
        DocumentType::PolicyStatement => {
            let reference = reference.as_deref().unwrap_or_default();
            if !PS_REFERENCE.is_match(reference) {
                return Err(malformed(
                    doc,
                    &format!("'{reference}' is not a policy statement reference (PSnn/n)"),
                ));
            }
        }
        DocumentType::ConsultationPaper => {
            let reference = reference.as_deref().unwrap_or_default();
            if !CP_REFERENCE.is_match(reference) {
                return Err(malformed(
                    doc,
                    &format!("'{reference}' is not a consultation paper reference (CPnn/n)"),
                ));
            }
        }
        DocumentType::Firm => {
            if !FRN.is_match(source_id) {
                return Err(malformed(doc, "firm reference number must be 6-7 digits"));
            }
        }
        DocumentType::EnforcementNotice => {}
    }

    let text = assemble_text(doc);
    let metadata = ChunkMetadata {
        title: doc.title.trim().to_string(),
        document_uri: doc.document_uri(),
        reference: doc.reference.clone().filter(|r| !r.trim().is_empty()),
        hierarchy: doc.hierarchy.clone(),
        published_at: doc.published_at,
        url: doc.url.clone(),
    };

    Ok(NormalizedDocument {
        doc_type: doc.doc_type,
        source_id: source_id.to_string(),
        text,
        metadata,
        last_modified: doc.last_modified,
    })
}

/// Composite text per type. Long-form documents prepend their title so the
/// first chunk is self-describing; firm records additionally fold flat
/// register fields from `extra` into the body, in sorted key order for
/// determinism.
fn assemble_text(doc: &SourceDocument) -> String {
    let title = doc.title.trim();
    let body = doc.body.trim();
    let mut text = if title.is_empty() {
        body.to_string()
    } else {
        format!("{title}\n\n{body}")
    };

    if doc.doc_type == DocumentType::Firm {
        if let serde_json::Value::Object(map) = &doc.extra {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                match &map[key] {
                    serde_json::Value::String(s) if !s.trim().is_empty() => {
                        text.push('\n');
                        text.push_str(key);
                        text.push_str(": ");
                        text.push_str(s.trim());
                    }
                    _ => {}
                }
            }
        }
    }

    text
}

fn malformed(doc: &SourceDocument, reason: &str) -> RegError {
    RegError::MalformedSource {
        doc_type: doc.doc_type,
        source_id: doc.source_id.clone(),
        reason: reason.to_string(),
    }
}
