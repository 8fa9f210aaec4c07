//! Transcript analysis: content cache, text extraction, prompt resolution,
//! and the analysis worker pool.

pub mod content_store;
pub mod extract;
pub mod prompt;
pub mod worker;

pub use content_store::ContentStore;
pub use worker::{analysis_backoff, AnalysisWorker};
