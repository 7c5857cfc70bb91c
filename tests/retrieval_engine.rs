//! Hybrid search behavior over an ingested corpus: relevance, determinism,
//! filters, and partial degradation when an index is missing.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use regsmith::documents::{DocumentType, SourceDocument};
use regsmith::embeddings::MockEmbeddingProvider;
use regsmith::ingest::{IngestionMode, RunOptions};
use regsmith::retrieval::SearchRequest;
use regsmith::service::CorpusService;
use regsmith::sources::StaticSource;
use regsmith::stores::SearchFilters;

fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

struct Harness {
    service: CorpusService,
    source: Arc<StaticSource>,
    embedder: Arc<MockEmbeddingProvider>,
}

/// Handbook sections plus policy statements, mirroring a small slice of the
/// real corpus.
async fn ingested_harness() -> Harness {
    let source = Arc::new(StaticSource::new());
    let embedder = Arc::new(MockEmbeddingProvider::new(128));
    let service = CorpusService::builder()
        .with_fetcher(source.clone())
        .with_embedder(embedder.clone())
        .build()
        .unwrap();

    source.set_documents(
        DocumentType::Handbook,
        vec![
            SourceDocument::new(
                DocumentType::Handbook,
                "CONC_5_2A",
                "Creditworthiness assessment",
                "Before making a regulated credit agreement the firm must undertake \
                 an assessment of the customer's creditworthiness. Consumer credit \
                 lending decisions must consider affordability.",
            )
            .with_hierarchy(vec!["CONC".into(), "5".into(), "2A".into()])
            .with_published_at(ts(2024, 3, 1))
            .with_last_modified(ts(2024, 3, 1)),
            SourceDocument::new(
                DocumentType::Handbook,
                "SYSC_4_1",
                "General organisational requirements",
                "A firm must have robust governance arrangements, effective processes \
                 to identify and manage risks, and adequate internal control mechanisms.",
            )
            .with_hierarchy(vec!["SYSC".into(), "4".into(), "1".into()])
            .with_published_at(ts(2023, 1, 15))
            .with_last_modified(ts(2023, 1, 15)),
        ],
    );
    source.set_documents(
        DocumentType::PolicyStatement,
        vec![
            SourceDocument::new(
                DocumentType::PolicyStatement,
                "PS24/1",
                "Consumer credit regulatory returns",
                "Final rules on regulatory reporting for consumer credit firms, \
                 including lending volumes and arrears data.",
            )
            .with_reference("PS24/1")
            .with_published_at(ts(2024, 1, 10))
            .with_last_modified(ts(2024, 1, 10)),
        ],
    );

    for doc_type in [DocumentType::Handbook, DocumentType::PolicyStatement] {
        let report = service
            .run_ingestion(doc_type, IngestionMode::Full, RunOptions::default())
            .await;
        assert!(report.succeeded(), "{doc_type}: {:?}", report.error);
    }

    Harness {
        service,
        source,
        embedder,
    }
}

#[tokio::test]
async fn hybrid_search_surfaces_token_overlap_matches_first() {
    let hx = ingested_harness().await;
    let response = hx
        .service
        .search(
            &SearchRequest::new("consumer credit", 5)
                .with_doc_types(vec![DocumentType::Handbook]),
        )
        .await
        .unwrap();
    assert!(!response.hits.is_empty());
    assert_eq!(response.hits[0].key.source_id, "CONC_5_2A");
    assert!(response.unavailable.is_empty());
}

#[tokio::test]
async fn repeated_queries_return_identical_rankings() {
    let hx = ingested_harness().await;
    let request = SearchRequest::new("consumer credit lending", 10);
    let first = hx.service.search(&request).await.unwrap();
    let second = hx.service.search(&request).await.unwrap();

    let order = |hits: &[regsmith::retrieval::RankedHit]| {
        hits.iter()
            .map(|hit| (hit.doc_type, hit.key.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(order(&first.hits), order(&second.hits));
}

#[tokio::test]
async fn missing_index_degrades_to_partial_results() {
    let hx = ingested_harness().await;
    // Firm index was never created; querying it alongside handbook must not
    // sink the whole request.
    let response = hx
        .service
        .search(
            &SearchRequest::new("consumer credit", 5)
                .with_doc_types(vec![DocumentType::Handbook, DocumentType::Firm]),
        )
        .await
        .unwrap();
    assert!(!response.hits.is_empty());
    assert_eq!(response.unavailable.len(), 1);
    assert_eq!(response.unavailable[0].doc_type, DocumentType::Firm);
    assert!(response.unavailable[0].reason.contains("no index"));
}

#[tokio::test]
async fn blank_query_is_a_filter_scan_without_embedding_calls() {
    let hx = ingested_harness().await;
    let calls_before = hx.embedder.calls();

    let response = hx
        .service
        .search(
            &SearchRequest::new("   ", 10)
                .with_doc_types(vec![DocumentType::Handbook])
                .with_filters(SearchFilters {
                    published_after: Some(ts(2024, 1, 1)),
                    ..Default::default()
                }),
        )
        .await
        .unwrap();
    assert_eq!(hx.embedder.calls(), calls_before);
    assert_eq!(response.hits.len(), 1);
    assert_eq!(response.hits[0].key.source_id, "CONC_5_2A");
}

#[tokio::test]
async fn reference_and_hierarchy_filters_narrow_results() {
    let hx = ingested_harness().await;

    let by_reference = hx
        .service
        .search(
            &SearchRequest::new("consumer credit", 10).with_filters(SearchFilters {
                reference: Some("PS24/1".into()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    assert!(
        by_reference
            .hits
            .iter()
            .all(|hit| hit.metadata.reference.as_deref() == Some("PS24/1"))
    );
    assert!(!by_reference.hits.is_empty());

    let by_hierarchy = hx
        .service
        .search(
            &SearchRequest::new("firm requirements", 10)
                .with_doc_types(vec![DocumentType::Handbook])
                .with_filters(SearchFilters {
                    hierarchy_prefix: vec!["SYSC".into()],
                    ..Default::default()
                }),
        )
        .await
        .unwrap();
    assert!(!by_hierarchy.hits.is_empty());
    assert!(
        by_hierarchy
            .hits
            .iter()
            .all(|hit| hit.metadata.hierarchy.first().map(String::as_str) == Some("SYSC"))
    );
}

#[tokio::test]
async fn refreshed_corpus_serves_updated_text_without_full_re_embedding() {
    let hx = ingested_harness().await;
    let embedded_before = hx.embedder.texts_embedded();

    hx.source.upsert_document(
        SourceDocument::new(
            DocumentType::Handbook,
            "CONC_5_2A",
            "Creditworthiness assessment",
            "Updated: consumer credit affordability checks now cover buy now pay \
             later agreements as well.",
        )
        .with_hierarchy(vec!["CONC".into(), "5".into(), "2A".into()])
        .with_published_at(ts(2024, 9, 1))
        .with_last_modified(ts(2024, 9, 1)),
    );

    let report = hx
        .service
        .run_ingestion(
            DocumentType::Handbook,
            IngestionMode::SinceCursor,
            RunOptions::default(),
        )
        .await;
    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(report.counters.fetched, 1);
    // Only the edited document was re-embedded.
    assert_eq!(hx.embedder.texts_embedded(), embedded_before + 1);

    let response = hx
        .service
        .search(&SearchRequest::new("buy now pay later", 5))
        .await
        .unwrap();
    assert_eq!(response.hits[0].key.source_id, "CONC_5_2A");
    assert!(response.hits[0].text.contains("buy now pay later"));
}
