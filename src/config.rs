//! Typed configuration with environment overrides.
//!
//! Every knob has a working default so tests and offline runs need no
//! environment at all; `RegsmithConfig::from_env` layers `REGSMITH_*`
//! variables (and a local `.env` file via dotenvy) on top.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::documents::ChunkerConfig;
use crate::embeddings::RetryPolicy;

/// Embedding service and batching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// OpenAI-style embeddings endpoint. `None` means callers must supply a
    /// provider themselves (tests use the mock).
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    /// Maximum texts per embedding request.
    pub batch_size: usize,
    /// Maximum concurrent embedding requests across all runs.
    pub max_in_flight: usize,
    /// Minimum spacing between outbound embedding requests.
    pub min_interval_ms: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: "text-embedding-3-large".to_string(),
            dimensions: 1024,
            batch_size: 16,
            max_in_flight: 4,
            min_interval_ms: 0,
            max_attempts: 3,
            retry_base_delay_ms: 200,
        }
    }
}

impl EmbeddingConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            multiplier: 2.0,
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// Ingestion run behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// A run fails outright once more than this fraction of its documents
    /// end up failed (malformed or unembeddable).
    pub failure_threshold: f64,
    /// Trailing window for `IngestionMode::Window` when the caller does not
    /// override it.
    pub window_days: i64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            window_days: 7,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegsmithConfig {
    /// Prefix for per-type index names (the upstream system used `fca_mcp`).
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
}

impl Default for RegsmithConfig {
    fn default() -> Self {
        Self {
            index_prefix: default_index_prefix(),
            chunker: ChunkerConfig::default(),
            embedding: EmbeddingConfig::default(),
            ingestion: IngestionConfig::default(),
        }
    }
}

fn default_index_prefix() -> String {
    "regsmith".to_string()
}

impl RegsmithConfig {
    /// Loads configuration from the environment, starting from defaults.
    ///
    /// Unparseable values are logged and ignored rather than failing startup.
    pub fn from_env() -> Self {
        // A missing .env file is the normal case outside local development.
        let _ = dotenvy::dotenv();

        let mut config = Self::default();

        if let Ok(prefix) = std::env::var("REGSMITH_INDEX_PREFIX") {
            if !prefix.trim().is_empty() {
                config.index_prefix = prefix.trim().to_string();
            }
        }
        if let Ok(endpoint) = std::env::var("REGSMITH_EMBEDDING_ENDPOINT") {
            config.embedding.endpoint = Some(endpoint);
        }
        if let Ok(key) = std::env::var("REGSMITH_EMBEDDING_API_KEY") {
            config.embedding.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("REGSMITH_EMBEDDING_MODEL") {
            config.embedding.model = model;
        }

        set_parsed(&mut config.embedding.dimensions, "REGSMITH_EMBEDDING_DIMENSIONS");
        set_parsed(&mut config.embedding.batch_size, "REGSMITH_EMBEDDING_BATCH_SIZE");
        set_parsed(&mut config.embedding.max_in_flight, "REGSMITH_EMBEDDING_MAX_IN_FLIGHT");
        set_parsed(&mut config.embedding.min_interval_ms, "REGSMITH_EMBEDDING_MIN_INTERVAL_MS");
        set_parsed(&mut config.chunker.max_chars, "REGSMITH_CHUNK_MAX_CHARS");
        set_parsed(&mut config.chunker.overlap_chars, "REGSMITH_CHUNK_OVERLAP_CHARS");
        set_parsed(&mut config.ingestion.failure_threshold, "REGSMITH_FAILURE_THRESHOLD");
        set_parsed(&mut config.ingestion.window_days, "REGSMITH_WINDOW_DAYS");

        config
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => warn!(%var, %raw, "ignoring unparseable configuration value"),
        }
    }
}
