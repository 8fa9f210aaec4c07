//! Request/response bodies for the admin surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatusResponse {
    pub scheduler_running: bool,
    pub is_polling: bool,
    pub poll_interval_seconds: u64,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub next_poll_in_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub accepted: bool,
    pub already_polling: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeRequestBody {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub quarter: Option<i64>,
    #[serde(default)]
    pub year: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub transcript_id: i64,
    pub idempotency_key: String,
    /// False when the key already named a job (request deduplicated).
    pub job_created: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArticlesRequestBody {
    pub quarter: i64,
    pub year: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticlesResponse {
    pub run_id: i64,
    pub group_id: i64,
    pub quarter: i64,
    pub year: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatusEntry {
    pub queue: String,
    pub ready: i64,
    pub delayed: i64,
    pub in_flight: i64,
    pub dead: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesStatusResponse {
    pub queues: Vec<QueueStatusEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEquityStatus {
    pub equity_id: i64,
    pub symbol: String,
    pub on_watchlist: bool,
    pub quarter: i64,
    pub year: i64,
    pub transcript_status: Option<String>,
    pub analysis_status: Option<String>,
    pub schedule_attempts: Option<i64>,
    pub next_check_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatusResponse {
    pub quarter: i64,
    pub year: i64,
    pub equities: Vec<PipelineEquityStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
