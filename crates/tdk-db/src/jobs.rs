//! Analysis jobs: the durable unit of analysis work, keyed by idempotency.
//!
//! A job is created by its producer (fetcher or admin surface) before the
//! matching `analysis_request` message becomes visible; the worker resolves
//! the message back to the job by key. Queue attempts drive retries; the job
//! row mirrors them so the UI can show a "retrying" state from durable
//! fields alone.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::is_unique_violation;
use sha2::{Digest, Sha256};

/// Deterministic name of one unit of analysis work.
///
/// Generation 0 is the poll-originated request for a `(transcript, url)`;
/// forced re-analyses use `1 + stored analysis count` so every force gets a
/// fresh key without ever colliding with the poll path.
pub fn idempotency_key(transcript_id: i64, source_url: &str, generation: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{transcript_id}|{source_url}|{generation}").as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    InProgress,
    Done,
    Error,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            "dead" => Ok(JobStatus::Dead),
            other => Err(anyhow!("invalid job status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub job_id: i64,
    pub transcript_id: i64,
    pub status: String,
    pub attempts: i64,
    pub idempotency_key: String,
    pub force: bool,
    pub retry_next_at_utc: Option<DateTime<Utc>>,
    pub locked_until_utc: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at_utc: DateTime<Utc>,
}

const JOB_COLUMNS: &str = "job_id, transcript_id, status, attempts, idempotency_key, force, \
     retry_next_at_utc, locked_until_utc, error_message, created_at_utc";

/// Create a job. Returns `Ok(None)` when the idempotency key already names a
/// job — the caller must not publish a second message for it.
pub async fn insert_job_deduped(
    pool: &SqlitePool,
    transcript_id: i64,
    idempotency_key: &str,
    force: bool,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let res: Result<(i64,), sqlx::Error> = sqlx::query_as(
        r#"
        insert into analysis_jobs (transcript_id, idempotency_key, force, created_at_utc)
        values (?1, ?2, ?3, ?4)
        returning job_id
        "#,
    )
    .bind(transcript_id)
    .bind(idempotency_key)
    .bind(force)
    .bind(now)
    .fetch_one(pool)
    .await;

    match res {
        Ok((job_id,)) => Ok(Some(job_id)),
        Err(e) if is_unique_violation(&e) => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context("insert_job_deduped failed")),
    }
}

pub async fn fetch_job_by_key(
    pool: &SqlitePool,
    idempotency_key: &str,
) -> Result<Option<JobRow>> {
    let sql = format!("select {JOB_COLUMNS} from analysis_jobs where idempotency_key = ?1");
    sqlx::query_as::<_, JobRow>(&sql)
        .bind(idempotency_key)
        .fetch_optional(pool)
        .await
        .context("fetch_job_by_key failed")
}

/// Transition to `in_progress` and take the work lease. Attempt count goes up
/// here, so a worker crash mid-flight still shows as a consumed attempt.
pub async fn job_begin_attempt(
    pool: &SqlitePool,
    idempotency_key: &str,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<Option<JobRow>> {
    let sql = format!(
        r#"
        update analysis_jobs
           set status = 'in_progress',
               attempts = attempts + 1,
               locked_until_utc = ?2
         where idempotency_key = ?1
           and status in ('pending', 'in_progress')
        returning {JOB_COLUMNS}
        "#
    );
    sqlx::query_as::<_, JobRow>(&sql)
        .bind(idempotency_key)
        .bind(now + lease)
        .fetch_optional(pool)
        .await
        .context("job_begin_attempt failed")
}

pub async fn job_mark_done(pool: &SqlitePool, idempotency_key: &str) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update analysis_jobs
           set status = 'done',
               retry_next_at_utc = null,
               locked_until_utc = null,
               error_message = null
         where idempotency_key = ?1
        "#,
    )
    .bind(idempotency_key)
    .execute(pool)
    .await
    .context("job_mark_done failed")?;
    Ok(res.rows_affected() > 0)
}

/// Transient failure: back to `pending` with a retry horizon; the queue
/// redelivery at `retry_at` picks it up again.
pub async fn job_mark_retrying(
    pool: &SqlitePool,
    idempotency_key: &str,
    retry_at: DateTime<Utc>,
    error: &str,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update analysis_jobs
           set status = 'pending',
               retry_next_at_utc = ?2,
               locked_until_utc = null,
               error_message = ?3
         where idempotency_key = ?1
        "#,
    )
    .bind(idempotency_key)
    .bind(retry_at)
    .bind(error)
    .execute(pool)
    .await
    .context("job_mark_retrying failed")?;
    Ok(res.rows_affected() > 0)
}

/// Terminal failure (`error` for permanent classification, `dead` for
/// attempt exhaustion).
pub async fn job_mark_failed(
    pool: &SqlitePool,
    idempotency_key: &str,
    status: JobStatus,
    error: &str,
) -> Result<bool> {
    debug_assert!(matches!(status, JobStatus::Error | JobStatus::Dead));
    let res = sqlx::query(
        r#"
        update analysis_jobs
           set status = ?2,
               retry_next_at_utc = null,
               locked_until_utc = null,
               error_message = ?3
         where idempotency_key = ?1
        "#,
    )
    .bind(idempotency_key)
    .bind(status.as_str())
    .bind(error)
    .execute(pool)
    .await
    .context("job_mark_failed failed")?;
    Ok(res.rows_affected() > 0)
}

/// Jobs for one transcript, newest first — admin read model.
pub async fn list_jobs_for_transcript(
    pool: &SqlitePool,
    transcript_id: i64,
) -> Result<Vec<JobRow>> {
    let sql = format!(
        "select {JOB_COLUMNS} from analysis_jobs \
         where transcript_id = ?1 order by job_id desc"
    );
    sqlx::query_as::<_, JobRow>(&sql)
        .bind(transcript_id)
        .fetch_all(pool)
        .await
        .context("list_jobs_for_transcript failed")
}
