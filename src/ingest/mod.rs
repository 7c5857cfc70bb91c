//! Ingestion: staged pipeline runs plus cursor persistence.

pub mod cursor;
pub mod pipeline;

pub use cursor::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use pipeline::{
    IngestionMode, IngestionPipeline, IngestionReport, RunCounters, RunOptions, RunStage,
};
