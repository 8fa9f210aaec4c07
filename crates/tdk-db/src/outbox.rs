//! Email outbox rows.
//!
//! This lane is persisted as its own table rather than an opaque queue
//! message so the UI can inspect per-recipient delivery state. Claiming
//! works like a queue lease; `(analysis_id, recipient)` uniqueness is the
//! at-most-one-send guarantee.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::is_unique_violation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "sent" => Ok(OutboxStatus::Sent),
            "failed" => Ok(OutboxStatus::Failed),
            "dead" => Ok(OutboxStatus::Dead),
            other => Err(anyhow!("invalid outbox status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct OutboxRow {
    pub outbox_id: i64,
    pub analysis_id: i64,
    pub recipient: String,
    pub status: String,
    pub attempts: i64,
    pub scheduled_at_utc: DateTime<Utc>,
    pub retry_next_at_utc: Option<DateTime<Utc>>,
    pub locked_until_utc: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub sent_at_utc: Option<DateTime<Utc>>,
}

const OUTBOX_COLUMNS: &str = "outbox_id, analysis_id, recipient, status, attempts, \
     scheduled_at_utc, retry_next_at_utc, locked_until_utc, last_error, sent_at_utc";

/// Queue one notification. Returns `Ok(false)` when the
/// `(analysis_id, recipient)` pair already exists — replays of the analysis
/// completion path cannot double-book a send.
pub async fn outbox_insert_deduped(
    pool: &SqlitePool,
    analysis_id: i64,
    recipient: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        insert into email_outbox (analysis_id, recipient, scheduled_at_utc)
        values (?1, ?2, ?3)
        "#,
    )
    .bind(analysis_id)
    .bind(recipient)
    .bind(now)
    .execute(pool)
    .await;

    match res {
        Ok(_) => Ok(true),
        Err(e) if is_unique_violation(&e) => Ok(false),
        Err(e) => Err(anyhow::Error::new(e).context("outbox_insert_deduped failed")),
    }
}

/// Claim up to `batch` sendable rows: `pending`, past their retry horizon,
/// and not leased. Attempts count failures, not claims, per the retry table.
pub async fn outbox_claim_due(
    pool: &SqlitePool,
    batch: i64,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<Vec<OutboxRow>> {
    let locked_until = now + lease;
    let sql = format!(
        r#"
        update email_outbox
           set locked_until_utc = ?1
         where outbox_id in (
             select outbox_id from email_outbox
             where status = 'pending'
               and scheduled_at_utc <= ?2
               and (retry_next_at_utc is null or retry_next_at_utc <= ?2)
               and (locked_until_utc is null or locked_until_utc < ?2)
             order by outbox_id asc
             limit ?3
         )
        returning {OUTBOX_COLUMNS}
        "#
    );
    let mut rows = sqlx::query_as::<_, OutboxRow>(&sql)
        .bind(locked_until)
        .bind(now)
        .bind(batch)
        .fetch_all(pool)
        .await
        .context("outbox_claim_due failed")?;

    rows.sort_by_key(|r| r.outbox_id);
    Ok(rows)
}

/// `pending → sent`. Returns `false` if the row was not pending (a second
/// worker after lease expiry observed our completed send).
pub async fn outbox_mark_sent(
    pool: &SqlitePool,
    outbox_id: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update email_outbox
           set status = 'sent',
               sent_at_utc = coalesce(sent_at_utc, ?2),
               locked_until_utc = null,
               last_error = null
         where outbox_id = ?1 and status = 'pending'
        "#,
    )
    .bind(outbox_id)
    .bind(now)
    .execute(pool)
    .await
    .context("outbox_mark_sent failed")?;
    Ok(res.rows_affected() > 0)
}

/// Transient send failure: bump attempts, set the retry horizon, release the
/// lease. Returns the new attempt count so the caller can dead-letter at the
/// cap.
pub async fn outbox_mark_retry(
    pool: &SqlitePool,
    outbox_id: i64,
    retry_at: DateTime<Utc>,
    error: &str,
) -> Result<i64> {
    let (attempts,): (i64,) = sqlx::query_as(
        r#"
        update email_outbox
           set attempts = attempts + 1,
               retry_next_at_utc = ?2,
               locked_until_utc = null,
               last_error = ?3
         where outbox_id = ?1
        returning attempts
        "#,
    )
    .bind(outbox_id)
    .bind(retry_at)
    .bind(error)
    .fetch_one(pool)
    .await
    .context("outbox_mark_retry failed")?;
    Ok(attempts)
}

/// Terminal transition (`failed` on permanent rejection, `dead` on attempt
/// exhaustion).
pub async fn outbox_mark_terminal(
    pool: &SqlitePool,
    outbox_id: i64,
    status: OutboxStatus,
    error: &str,
) -> Result<bool> {
    debug_assert!(matches!(status, OutboxStatus::Failed | OutboxStatus::Dead));
    let res = sqlx::query(
        r#"
        update email_outbox
           set status = ?2,
               attempts = attempts + 1,
               locked_until_utc = null,
               last_error = ?3
         where outbox_id = ?1
        "#,
    )
    .bind(outbox_id)
    .bind(status.as_str())
    .bind(error)
    .execute(pool)
    .await
    .context("outbox_mark_terminal failed")?;
    Ok(res.rows_affected() > 0)
}

pub async fn list_outbox_for_analysis(
    pool: &SqlitePool,
    analysis_id: i64,
) -> Result<Vec<OutboxRow>> {
    let sql = format!(
        "select {OUTBOX_COLUMNS} from email_outbox \
         where analysis_id = ?1 order by outbox_id asc"
    );
    sqlx::query_as::<_, OutboxRow>(&sql)
        .bind(analysis_id)
        .fetch_all(pool)
        .await
        .context("list_outbox_for_analysis failed")
}

/// Housekeeping: drop terminal rows older than the retention cutoff.
pub async fn prune_terminal_outbox(pool: &SqlitePool, before: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query(
        r#"
        delete from email_outbox
         where status in ('sent','failed','dead')
           and coalesce(sent_at_utc, scheduled_at_utc) < ?1
        "#,
    )
    .bind(before)
    .execute(pool)
    .await
    .context("prune_terminal_outbox failed")?;
    Ok(res.rows_affected())
}
