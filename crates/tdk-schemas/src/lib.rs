//! Shared message payloads carried on the durable queues.
//!
//! Every payload round-trips through `serde_json::Value` in the
//! `queue_messages` table, so all fields are plain serde types. Workers must
//! tolerate replays: the broker is at-least-once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One poll instruction for the fetcher pool.
///
/// `row_id` pins the message to the schedule row that produced it; a row that
/// has been retired or re-targeted since dispatch makes the message stale and
/// the fetcher acks it as a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptCheck {
    pub row_id: i64,
    pub equity_id: i64,
    pub quarter: i64,
    pub year: i64,
}

/// Request to analyse one transcript.
///
/// `idempotency_key` names the unit of work; the matching `analysis_jobs` row
/// is created by the producer (fetcher or admin surface) before this message
/// becomes visible, so a consumer that cannot find the job treats the message
/// as stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub transcript_id: i64,
    pub source_url: String,
    pub force: bool,
    pub idempotency_key: String,
}

/// Two-stage group research traffic on the `group_research_request` queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupResearchRequest {
    /// Stage 1: an analysis for `equity_id` finished; the coordinator checks
    /// fan-in readiness for every active group containing the equity.
    MemberReady {
        equity_id: i64,
        quarter: i64,
        year: i64,
    },
    /// Stage 2: run the research article for one group and quarter.
    Dispatch {
        group_id: i64,
        quarter: i64,
        year: i64,
        force: bool,
    },
}

/// Zero-payload poke that forces an immediate scheduler dispatch pass.
///
/// Published by `POST /scheduler/trigger` with no delay; the scheduler drains
/// the lane at the top of its tick loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerTick {
    pub requested_at_utc: DateTime<Utc>,
}
