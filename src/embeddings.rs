//! Embedding provider adapter: remote service client, retry policy, and the
//! shared outbound rate limiter.
//!
//! The pipeline and the retrieval engine only ever see the
//! [`EmbeddingProvider`] trait. Production runs use
//! [`HttpEmbeddingProvider`] against an OpenAI-style embeddings endpoint;
//! tests use the deterministic [`MockEmbeddingProvider`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::types::RegError;

/// Converts an ordered batch of texts into a parallel ordered batch of
/// fixed-dimension vectors.
///
/// Implementations must never reorder or drop inputs: a length mismatch
/// between input and output is [`RegError::EmbeddingBatchMismatch`], not a
/// partial success.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RegError>;

    /// Identifier of the embedding model, stored alongside each vector.
    fn model(&self) -> &str;

    /// Output dimensionality; index definitions are fixed to this size.
    fn dimensions(&self) -> usize;
}

/// Bounded-attempt retry with exponential backoff.
///
/// Expressed as data rather than nested error handling so the pipeline can
/// report exactly why a batch was marked failed.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (attempt numbering starts at 1; there is
    /// no delay before the first attempt).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.base_delay.mul_f64(factor)
    }
}

/// Embeds one batch with retries, going through the shared limiter on every
/// attempt.
///
/// Transport failures are retried up to `policy.max_attempts`; a batch-length
/// mismatch is surfaced immediately because retrying cannot make vector
/// assignment safe.
pub async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    limiter: &EmbeddingLimiter,
    texts: &[String],
    policy: &RetryPolicy,
) -> Result<Vec<Vec<f32>>, RegError> {
    let mut attempt = 1u32;
    loop {
        let _permit = limiter.acquire().await;
        match provider.embed_batch(texts).await {
            Ok(vectors) => {
                if vectors.len() != texts.len() {
                    return Err(RegError::EmbeddingBatchMismatch {
                        sent: texts.len(),
                        received: vectors.len(),
                    });
                }
                return Ok(vectors);
            }
            Err(err @ RegError::EmbeddingBatchMismatch { .. }) => return Err(err),
            Err(err) if attempt < policy.max_attempts => {
                let delay = policy.delay_before(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    error = %err,
                    "embedding batch failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Outbound throttle shared by every concurrent caller of the embedding
/// service: at most `max_in_flight` requests at once, spaced at least
/// `min_interval` apart.
///
/// Ingestion runs for different document types share one instance, so the
/// upstream rate limit holds globally rather than per run.
pub struct EmbeddingLimiter {
    permits: Arc<Semaphore>,
    min_interval: Duration,
    last_dispatch: Mutex<Option<Instant>>,
}

impl EmbeddingLimiter {
    pub fn new(max_in_flight: usize, min_interval: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            min_interval,
            last_dispatch: Mutex::new(None),
        }
    }

    /// Waits for a slot and for the spacing interval, returning a permit that
    /// is held for the duration of the request.
    pub async fn acquire(&self) -> tokio::sync::OwnedSemaphorePermit {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("limiter semaphore never closed");

        if !self.min_interval.is_zero() {
            let mut last = self.last_dispatch.lock().await;
            if let Some(prev) = *last {
                let elapsed = prev.elapsed();
                if elapsed < self.min_interval {
                    tokio::time::sleep(self.min_interval - elapsed).await;
                }
            }
            *last = Some(Instant::now());
        }
        permit
    }
}

// ============================================================================
// HTTP provider
// ============================================================================

/// Client for an OpenAI-style embeddings endpoint
/// (`POST {endpoint}` with `{"model": ..., "input": [...]}`).
///
/// The upstream deployment this replaces was an Azure OpenAI
/// `text-embedding-3-large` endpoint; any service speaking the same shape
/// works.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(
        endpoint: Url,
        model: impl Into<String>,
        dimensions: usize,
        api_key: Option<String>,
    ) -> Result<Self, RegError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| RegError::EmbeddingProvider(err.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            model: model.into(),
            dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RegError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|err| RegError::EmbeddingProvider(err.to_string()))?;

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|err| RegError::EmbeddingProvider(err.to_string()))?;

        if parsed.data.len() != texts.len() {
            return Err(RegError::EmbeddingBatchMismatch {
                sent: texts.len(),
                received: parsed.data.len(),
            });
        }

        // The service is allowed to answer out of order; the index field is
        // authoritative for assignment.
        let mut data = parsed.data;
        data.sort_by_key(|datum| datum.index);
        for (position, datum) in data.iter().enumerate() {
            if datum.index != position {
                return Err(RegError::EmbeddingProvider(format!(
                    "embedding response indices are not a permutation of the input \
                     (saw index {} at position {position})",
                    datum.index
                )));
            }
            if datum.embedding.len() != self.dimensions {
                return Err(RegError::EmbeddingProvider(format!(
                    "expected {}-dimensional vectors, received {}",
                    self.dimensions,
                    datum.embedding.len()
                )));
            }
        }

        debug!(batch = texts.len(), model = %self.model, "embedded batch");
        Ok(data.into_iter().map(|datum| datum.embedding).collect())
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ============================================================================
// Mock provider
// ============================================================================

/// Deterministic embedding double for tests and offline runs.
///
/// Vectors are bag-of-words: each whitespace token hashes to one dimension,
/// and the vector is L2-normalized. Texts sharing tokens therefore have
/// higher cosine similarity, which is enough signal for ranking assertions
/// without a live model. Call counters let tests assert that unchanged
/// content is never re-embedded.
pub struct MockEmbeddingProvider {
    dimensions: usize,
    calls: AtomicUsize,
    texts_embedded: AtomicUsize,
}

impl MockEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            calls: AtomicUsize::new(0),
            texts_embedded: AtomicUsize::new(0),
        }
    }

    /// Number of `embed_batch` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Total number of texts embedded across all calls.
    pub fn texts_embedded(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text.split_whitespace() {
            let token: String = token
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if token.is_empty() {
                continue;
            }
            let digest = Sha256::digest(token.as_bytes());
            let slot = u64::from_le_bytes(digest[..8].try_into().expect("8 bytes"))
                % self.dimensions as u64;
            vector[slot as usize] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RegError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }

    fn model(&self) -> &str {
        "mock-bag-of-words"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn mock_embeddings_are_deterministic() {
        let provider = MockEmbeddingProvider::new(64);
        let texts = vec![
            "consumer credit rules".to_string(),
            "operational resilience".to_string(),
            "consumer credit rules".to_string(),
        ];
        let first = provider.embed_batch(&texts).await.unwrap();
        let second = provider.embed_batch(&texts).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0], first[2]);
        assert_ne!(first[0], first[1]);
        assert_eq!(provider.calls(), 2);
        assert_eq!(provider.texts_embedded(), 6);
    }

    #[tokio::test]
    async fn mock_embeddings_reflect_token_overlap() {
        let provider = MockEmbeddingProvider::new(128);
        let vectors = provider
            .embed_batch(&[
                "consumer credit".to_string(),
                "consumer credit agreements and lending".to_string(),
                "market abuse regulation".to_string(),
            ])
            .await
            .unwrap();
        let overlapping = cosine(&vectors[0], &vectors[1]);
        let disjoint = cosine(&vectors[0], &vectors[2]);
        assert!(overlapping > disjoint);
    }

    #[tokio::test]
    async fn retry_surfaces_batch_mismatch_immediately() {
        struct ShortBatch;

        #[async_trait]
        impl EmbeddingProvider for ShortBatch {
            async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RegError> {
                Ok(vec![vec![0.0]; texts.len().saturating_sub(1)])
            }
            fn model(&self) -> &str {
                "short"
            }
            fn dimensions(&self) -> usize {
                1
            }
        }

        let limiter = EmbeddingLimiter::new(2, Duration::ZERO);
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            multiplier: 1.0,
        };
        let texts = vec!["a".to_string(), "b".to_string()];
        let err = embed_with_retry(&ShortBatch, &limiter, &texts, &policy)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegError::EmbeddingBatchMismatch {
                sent: 2,
                received: 1
            }
        ));
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failures() {
        struct FlakyProvider {
            failures_left: AtomicUsize,
            inner: MockEmbeddingProvider,
        }

        #[async_trait]
        impl EmbeddingProvider for FlakyProvider {
            async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RegError> {
                if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    n.checked_sub(1)
                }).is_ok()
                {
                    return Err(RegError::EmbeddingProvider("503".into()));
                }
                self.inner.embed_batch(texts).await
            }
            fn model(&self) -> &str {
                self.inner.model()
            }
            fn dimensions(&self) -> usize {
                self.inner.dimensions()
            }
        }

        let provider = FlakyProvider {
            failures_left: AtomicUsize::new(2),
            inner: MockEmbeddingProvider::new(16),
        };
        let limiter = EmbeddingLimiter::new(1, Duration::ZERO);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 1.0,
        };
        let texts = vec!["transient".to_string()];
        let vectors = embed_with_retry(&provider, &limiter, &texts, &policy)
            .await
            .unwrap();
        assert_eq!(vectors.len(), 1);
    }

    #[test]
    fn backoff_schedule_grows() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_before(2) > policy.delay_before(1));
    }

    #[tokio::test]
    async fn http_provider_reorders_by_response_index() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/embeddings")
                    .json_body_partial(r#"{"model": "text-embedding-3-large"}"#);
                then.status(200).json_body(serde_json::json!({
                    "data": [
                        { "index": 1, "embedding": [0.0, 1.0] },
                        { "index": 0, "embedding": [1.0, 0.0] }
                    ]
                }));
            })
            .await;

        let endpoint = Url::parse(&server.url("/embeddings")).unwrap();
        let provider =
            HttpEmbeddingProvider::new(endpoint, "text-embedding-3-large", 2, None).unwrap();
        let vectors = provider
            .embed_batch(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn http_provider_maps_server_errors_to_provider_errors() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(503);
            })
            .await;

        let endpoint = Url::parse(&server.url("/embeddings")).unwrap();
        let provider = HttpEmbeddingProvider::new(endpoint, "text-embedding-3-large", 2, None)
            .unwrap();
        let err = provider
            .embed_batch(&["text".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, RegError::EmbeddingProvider(_)));
    }

    #[tokio::test]
    async fn http_provider_rejects_wrong_dimensionality() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(200).json_body(serde_json::json!({
                    "data": [ { "index": 0, "embedding": [1.0, 0.0, 0.0] } ]
                }));
            })
            .await;

        let endpoint = Url::parse(&server.url("/embeddings")).unwrap();
        let provider = HttpEmbeddingProvider::new(endpoint, "text-embedding-3-large", 2, None)
            .unwrap();
        let err = provider
            .embed_batch(&["text".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("2-dimensional"));
    }
}
