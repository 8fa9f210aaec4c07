//! Transcript discovery: oracle client boundary, process-wide rate limiting,
//! and the fetch worker pool.

pub mod provider;
pub mod ratelimit;
pub mod worker;

pub use provider::{
    HttpTranscriptOracle, OracleError, OracleObservation, OracleQuery, TranscriptOracle,
};
pub use ratelimit::TokenBucket;
pub use worker::Fetcher;
