//! Provider boundary for transcript discovery.
//!
//! This module defines only the observation types, the error classification,
//! and the oracle trait; the HTTP implementation lives in [`HttpTranscriptOracle`]
//! with a `base_url` override so tests can point it at a local mock server.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// One `(equity, quarter, year)` lookup.
#[derive(Debug, Clone)]
pub struct OracleQuery {
    /// External identifier of the equity, exactly as ingested.
    pub identifier: String,
    /// Ticker symbol, for providers that key on it.
    pub symbol: String,
    pub quarter: i64,
    pub year: i64,
}

/// What the oracle reported for the quarter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleObservation {
    Available {
        source_url: String,
        event_date: Option<DateTime<Utc>>,
    },
    Upcoming {
        event_date: Option<DateTime<Utc>>,
    },
    None,
}

/// Errors from an oracle call, pre-classified for the retry policy.
#[derive(Debug)]
pub enum OracleError {
    /// Network or transport failure (always transient).
    Transport(String),
    /// Non-success HTTP status from the upstream API.
    Http { status: u16, message: String },
    /// A response payload could not be decoded (permanent).
    Decode(String),
}

impl OracleError {
    /// Transient errors are retried: transport failures, 5xx, and 429.
    pub fn is_transient(&self) -> bool {
        match self {
            OracleError::Transport(_) => true,
            OracleError::Http { status, .. } => *status == 429 || *status >= 500,
            OracleError::Decode(_) => false,
        }
    }

    /// 429 specifically — drives the token-bucket retreat.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, OracleError::Http { status: 429, .. })
    }
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleError::Transport(msg) => write!(f, "oracle transport error: {msg}"),
            OracleError::Http { status, message } => {
                write!(f, "oracle http error status={status}: {message}")
            }
            OracleError::Decode(msg) => write!(f, "oracle decode error: {msg}"),
        }
    }
}

impl std::error::Error for OracleError {}

/// Transcript-discovery contract.
///
/// Implementations must be object-safe (`Arc<dyn TranscriptOracle>`) and
/// `Send + Sync` for use across the fetcher pool.
#[async_trait::async_trait]
pub trait TranscriptOracle: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, query: &OracleQuery) -> Result<OracleObservation, OracleError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// HTTP-backed oracle.
///
/// API key is resolved by the caller and passed in; do not log it.
#[derive(Debug, Clone)]
pub struct HttpTranscriptOracle {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

impl HttpTranscriptOracle {
    pub fn new(api_key: String, base_url: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client build must not fail");
        HttpTranscriptOracle {
            api_key,
            http,
            base_url,
        }
    }

    fn transcripts_url(&self) -> String {
        format!("{}/v1/transcripts", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptLookupResponse {
    status: String,
    source_url: Option<String>,
    event_date: Option<DateTime<Utc>>,
}

#[async_trait::async_trait]
impl TranscriptOracle for HttpTranscriptOracle {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn check(&self, query: &OracleQuery) -> Result<OracleObservation, OracleError> {
        let resp = self
            .http
            .get(self.transcripts_url())
            .header("x-api-key", &self.api_key)
            .query(&[
                ("identifier", query.identifier.as_str()),
                ("symbol", query.symbol.as_str()),
                ("quarter", &query.quarter.to_string()),
                ("year", &query.year.to_string()),
            ])
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(OracleError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body: TranscriptLookupResponse = resp
            .json()
            .await
            .map_err(|e| OracleError::Decode(e.to_string()))?;

        match body.status.as_str() {
            "available" => {
                let source_url = body.source_url.ok_or_else(|| {
                    OracleError::Decode("available response without source_url".to_string())
                })?;
                Ok(OracleObservation::Available {
                    source_url,
                    event_date: body.event_date,
                })
            }
            "upcoming" => Ok(OracleObservation::Upcoming {
                event_date: body.event_date,
            }),
            "none" => Ok(OracleObservation::None),
            other => Err(OracleError::Decode(format!(
                "unknown oracle status '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests (mock HTTP server, no network)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn query() -> OracleQuery {
        OracleQuery {
            identifier: "US-ACME".to_string(),
            symbol: "ACME".to_string(),
            quarter: 2,
            year: 2026,
        }
    }

    fn oracle(base_url: String) -> HttpTranscriptOracle {
        HttpTranscriptOracle::new("test-key".to_string(), base_url, Duration::from_secs(15))
    }

    #[tokio::test]
    async fn available_response_parses_url_and_event_date() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/transcripts")
                    .header("x-api-key", "test-key")
                    .query_param("identifier", "US-ACME")
                    .query_param("quarter", "2");
                then.status(200).json_body(serde_json::json!({
                    "status": "available",
                    "source_url": "https://host/t/acme-q2.html",
                    "event_date": "2026-07-30T21:00:00Z"
                }));
            })
            .await;

        let obs = oracle(server.base_url()).check(&query()).await.unwrap();
        mock.assert_async().await;
        match obs {
            OracleObservation::Available {
                source_url,
                event_date,
            } => {
                assert_eq!(source_url, "https://host/t/acme-q2.html");
                assert!(event_date.is_some());
            }
            other => panic!("expected available, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upcoming_and_none_parse() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).query_param("quarter", "2");
                then.status(200)
                    .json_body(serde_json::json!({"status": "upcoming",
                        "event_date": "2026-08-04T21:00:00Z"}));
            })
            .await;
        let obs = oracle(server.base_url()).check(&query()).await.unwrap();
        assert!(matches!(obs, OracleObservation::Upcoming { event_date: Some(_) }));

        let server2 = MockServer::start_async().await;
        server2
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200).json_body(serde_json::json!({"status": "none"}));
            })
            .await;
        let obs = oracle(server2.base_url()).check(&query()).await.unwrap();
        assert_eq!(obs, OracleObservation::None);
    }

    #[tokio::test]
    async fn http_429_is_transient_and_rate_limited() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(429).body("slow down");
            })
            .await;

        let err = oracle(server.base_url()).check(&query()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn http_401_is_permanent() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(401).body("bad key");
            })
            .await;

        let err = oracle(server.base_url()).check(&query()).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(!err.is_rate_limited());
    }

    #[tokio::test]
    async fn garbage_body_is_a_permanent_decode_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200).body("<html>not json</html>");
            })
            .await;

        let err = oracle(server.base_url()).check(&query()).await.unwrap_err();
        assert!(matches!(err, OracleError::Decode(_)));
        assert!(!err.is_transient());
    }
}
