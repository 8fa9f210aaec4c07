//! Transcript rows, append-only oracle observations, and the per-transcript
//! analysis reservation.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::is_unique_violation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptStatus {
    None,
    Upcoming,
    Available,
}

impl TranscriptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptStatus::None => "none",
            TranscriptStatus::Upcoming => "upcoming",
            TranscriptStatus::Available => "available",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(TranscriptStatus::None),
            "upcoming" => Ok(TranscriptStatus::Upcoming),
            "available" => Ok(TranscriptStatus::Available),
            other => Err(anyhow!("invalid transcript status: {}", other)),
        }
    }
}

/// `transcripts.analysis_status` values. The column is NULL until an analysis
/// has ever been attempted; `InProgress` is the reservation (at most one
/// holder per transcript).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisState {
    InProgress,
    Done,
    Error,
}

impl AnalysisState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisState::InProgress => "in_progress",
            AnalysisState::Done => "done",
            AnalysisState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TranscriptRow {
    pub transcript_id: i64,
    pub equity_id: i64,
    pub quarter: i64,
    pub year: i64,
    pub source_url: Option<String>,
    pub content_path: Option<String>,
    pub status: String,
    pub event_date_utc: Option<DateTime<Utc>>,
    pub analysis_status: Option<String>,
    pub analysis_error: Option<String>,
    pub updated_at_utc: DateTime<Utc>,
}

const TRANSCRIPT_COLUMNS: &str = "transcript_id, equity_id, quarter, year, source_url, \
     content_path, status, event_date_utc, analysis_status, analysis_error, updated_at_utc";

/// Upsert an `available` observation.
///
/// Status never regresses and the first non-null `source_url` sticks: a
/// replacement URL for the same quarter requires the explicit force path, not
/// a poll. Returns the post-update row.
pub async fn upsert_available(
    pool: &SqlitePool,
    equity_id: i64,
    quarter: i64,
    year: i64,
    source_url: &str,
    event_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<TranscriptRow> {
    let sql = format!(
        r#"
        insert into transcripts
            (equity_id, quarter, year, source_url, status, event_date_utc, updated_at_utc)
        values (?1, ?2, ?3, ?4, 'available', ?5, ?6)
        on conflict (equity_id, quarter, year) do update
            set status = 'available',
                source_url = coalesce(transcripts.source_url, excluded.source_url),
                event_date_utc = coalesce(excluded.event_date_utc, transcripts.event_date_utc),
                updated_at_utc = excluded.updated_at_utc
        returning {TRANSCRIPT_COLUMNS}
        "#
    );
    sqlx::query_as::<_, TranscriptRow>(&sql)
        .bind(equity_id)
        .bind(quarter)
        .bind(year)
        .bind(source_url)
        .bind(event_date)
        .bind(now)
        .fetch_one(pool)
        .await
        .context("upsert_available failed")
}

/// Upsert an `upcoming` observation. An `available` row is left untouched
/// apart from the event date (no status regression).
pub async fn upsert_upcoming(
    pool: &SqlitePool,
    equity_id: i64,
    quarter: i64,
    year: i64,
    event_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<TranscriptRow> {
    let sql = format!(
        r#"
        insert into transcripts
            (equity_id, quarter, year, status, event_date_utc, updated_at_utc)
        values (?1, ?2, ?3, 'upcoming', ?4, ?5)
        on conflict (equity_id, quarter, year) do update
            set status = case when transcripts.status = 'available'
                              then transcripts.status else 'upcoming' end,
                event_date_utc = coalesce(excluded.event_date_utc, transcripts.event_date_utc),
                updated_at_utc = excluded.updated_at_utc
        returning {TRANSCRIPT_COLUMNS}
        "#
    );
    sqlx::query_as::<_, TranscriptRow>(&sql)
        .bind(equity_id)
        .bind(quarter)
        .bind(year)
        .bind(event_date)
        .bind(now)
        .fetch_one(pool)
        .await
        .context("upsert_upcoming failed")
}

pub async fn fetch_transcript(
    pool: &SqlitePool,
    transcript_id: i64,
) -> Result<Option<TranscriptRow>> {
    let sql = format!("select {TRANSCRIPT_COLUMNS} from transcripts where transcript_id = ?1");
    sqlx::query_as::<_, TranscriptRow>(&sql)
        .bind(transcript_id)
        .fetch_optional(pool)
        .await
        .context("fetch_transcript failed")
}

pub async fn fetch_transcript_by_key(
    pool: &SqlitePool,
    equity_id: i64,
    quarter: i64,
    year: i64,
) -> Result<Option<TranscriptRow>> {
    let sql = format!(
        "select {TRANSCRIPT_COLUMNS} from transcripts \
         where equity_id = ?1 and quarter = ?2 and year = ?3"
    );
    sqlx::query_as::<_, TranscriptRow>(&sql)
        .bind(equity_id)
        .bind(quarter)
        .bind(year)
        .fetch_optional(pool)
        .await
        .context("fetch_transcript_by_key failed")
}

pub async fn set_content_path(
    pool: &SqlitePool,
    transcript_id: i64,
    content_path: &str,
) -> Result<()> {
    sqlx::query("update transcripts set content_path = ?2 where transcript_id = ?1")
        .bind(transcript_id)
        .bind(content_path)
        .execute(pool)
        .await
        .context("set_content_path failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Oracle observations
// ---------------------------------------------------------------------------

/// Append one oracle observation.
///
/// Observations carrying a `source_url` are unique per
/// `(equity, quarter, year, url)`; a duplicate returns `Ok(false)` — this is
/// the first-observation gate that keeps one poll response from enqueueing
/// two analysis requests. URL-less observations (`upcoming`, `none`) always
/// append.
pub async fn record_event(
    pool: &SqlitePool,
    equity_id: i64,
    quarter: i64,
    year: i64,
    status: TranscriptStatus,
    source_url: Option<&str>,
    event_date: Option<DateTime<Utc>>,
    origin: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        insert into transcript_events
            (equity_id, quarter, year, status, source_url, event_date_utc, origin, observed_at_utc)
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(equity_id)
    .bind(quarter)
    .bind(year)
    .bind(status.as_str())
    .bind(source_url)
    .bind(event_date)
    .bind(origin)
    .bind(now)
    .execute(pool)
    .await;

    match res {
        Ok(_) => Ok(true),
        Err(e) if is_unique_violation(&e) => Ok(false),
        Err(e) => Err(anyhow::Error::new(e).context("record_event failed")),
    }
}

// ---------------------------------------------------------------------------
// Analysis reservation
// ---------------------------------------------------------------------------

/// Compare-and-set the analysis reservation: NULL/'done'/'error' →
/// 'in_progress'. Returns `false` when another worker holds the reservation.
///
/// The single UPDATE makes this the at-most-one-in-flight gate per
/// transcript; it survives restarts because a crashed holder is recovered via
/// the queue lease, which re-runs the idempotent completion path.
pub async fn try_reserve_analysis(pool: &SqlitePool, transcript_id: i64) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update transcripts
           set analysis_status = 'in_progress'
         where transcript_id = ?1
           and (analysis_status is null or analysis_status in ('done','error'))
        "#,
    )
    .bind(transcript_id)
    .execute(pool)
    .await
    .context("try_reserve_analysis failed")?;

    Ok(res.rows_affected() > 0)
}

/// Drop an `in_progress` reservation without recording an outcome (transient
/// failure; the job will be retried). No-op unless currently reserved.
pub async fn release_analysis_reservation(
    pool: &SqlitePool,
    transcript_id: i64,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update transcripts
           set analysis_status = null
         where transcript_id = ?1 and analysis_status = 'in_progress'
        "#,
    )
    .bind(transcript_id)
    .execute(pool)
    .await
    .context("release_analysis_reservation failed")?;
    Ok(res.rows_affected() > 0)
}

/// Record a permanent analysis failure against the transcript.
pub async fn mark_analysis_error(
    pool: &SqlitePool,
    transcript_id: i64,
    error: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update transcripts
           set analysis_status = 'error',
               analysis_error = ?2,
               updated_at_utc = ?3
         where transcript_id = ?1
        "#,
    )
    .bind(transcript_id)
    .bind(error)
    .bind(now)
    .execute(pool)
    .await
    .context("mark_analysis_error failed")?;
    Ok(())
}
