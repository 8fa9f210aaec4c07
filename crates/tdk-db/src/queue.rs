//! Row-level operations for the durable message queues.
//!
//! Policy (lease lengths, max attempts, backoff) lives in the broker crate;
//! this module is the storage contract: delayed visibility, lease claim with
//! attempt accounting, ack-as-delete, and the dead-letter move.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub message_id: i64,
    pub queue_name: String,
    pub payload: Value,
    pub available_at_utc: DateTime<Utc>,
    pub locked_until_utc: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub enqueued_at_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DeadLetterRow {
    pub message_id: i64,
    pub queue_name: String,
    pub payload: Value,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub failed_at_utc: DateTime<Utc>,
}

/// Live counts per queue for the admin surface.
#[derive(Debug, Clone, Default)]
pub struct QueueDepth {
    pub ready: i64,
    pub delayed: i64,
    pub in_flight: i64,
    pub dead: i64,
}

const MESSAGE_COLUMNS: &str =
    "message_id, queue_name, payload, available_at_utc, locked_until_utc, attempts, enqueued_at_utc";

pub async fn insert_message(
    pool: &SqlitePool,
    queue: &str,
    payload: &Value,
    available_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<i64> {
    let (message_id,): (i64,) = sqlx::query_as(
        r#"
        insert into queue_messages (queue_name, payload, available_at_utc, enqueued_at_utc)
        values (?1, ?2, ?3, ?4)
        returning message_id
        "#,
    )
    .bind(queue)
    .bind(payload)
    .bind(available_at)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("insert_message failed")?;
    Ok(message_id)
}

/// Claim up to `batch` visible messages: delivery is FIFO by
/// `(available_at, message_id)` and `attempts` is incremented at claim time,
/// so a lease expiry counts as a delivery attempt.
pub async fn claim_messages(
    pool: &SqlitePool,
    queue: &str,
    batch: i64,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<Vec<MessageRow>> {
    let locked_until = now + lease;
    let sql = format!(
        r#"
        update queue_messages
           set locked_until_utc = ?1,
               attempts = attempts + 1
         where message_id in (
             select message_id from queue_messages
             where queue_name = ?2
               and available_at_utc <= ?3
               and (locked_until_utc is null or locked_until_utc < ?3)
             order by available_at_utc asc, message_id asc
             limit ?4
         )
        returning {MESSAGE_COLUMNS}
        "#
    );
    let mut rows = sqlx::query_as::<_, MessageRow>(&sql)
        .bind(locked_until)
        .bind(queue)
        .bind(now)
        .bind(batch)
        .fetch_all(pool)
        .await
        .context("claim_messages failed")?;

    rows.sort_by(|a, b| {
        (a.available_at_utc, a.message_id).cmp(&(b.available_at_utc, b.message_id))
    });
    Ok(rows)
}

/// Delete a completed message. Returns `false` if it was already gone
/// (double-ack after lease expiry; harmless).
pub async fn delete_message(pool: &SqlitePool, message_id: i64) -> Result<bool> {
    let res = sqlx::query("delete from queue_messages where message_id = ?1")
        .bind(message_id)
        .execute(pool)
        .await
        .context("delete_message failed")?;
    Ok(res.rows_affected() > 0)
}

/// Return a message to the queue, visible again at `retry_at`.
pub async fn reschedule_message(
    pool: &SqlitePool,
    message_id: i64,
    retry_at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update queue_messages
           set available_at_utc = ?2,
               locked_until_utc = null
         where message_id = ?1
        "#,
    )
    .bind(message_id)
    .bind(retry_at)
    .execute(pool)
    .await
    .context("reschedule_message failed")?;
    Ok(res.rows_affected() > 0)
}

/// Push a claimed lease forward for long-running work.
pub async fn extend_lease(
    pool: &SqlitePool,
    message_id: i64,
    locked_until: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "update queue_messages set locked_until_utc = ?2 where message_id = ?1",
    )
    .bind(message_id)
    .bind(locked_until)
    .execute(pool)
    .await
    .context("extend_lease failed")?;
    Ok(res.rows_affected() > 0)
}

/// Move a poison message into `queue_dead_letters` and remove it from the
/// live set, atomically.
pub async fn dead_letter_message(
    pool: &SqlitePool,
    message_id: i64,
    last_error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let mut tx = pool.begin().await.context("dead_letter begin failed")?;

    let moved = sqlx::query(
        r#"
        insert into queue_dead_letters
            (message_id, queue_name, payload, attempts, last_error, failed_at_utc)
        select message_id, queue_name, payload, attempts, ?2, ?3
        from queue_messages where message_id = ?1
        "#,
    )
    .bind(message_id)
    .bind(last_error)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("dead_letter insert failed")?
    .rows_affected();

    sqlx::query("delete from queue_messages where message_id = ?1")
        .bind(message_id)
        .execute(&mut *tx)
        .await
        .context("dead_letter delete failed")?;

    tx.commit().await.context("dead_letter commit failed")?;
    Ok(moved > 0)
}

pub async fn queue_depth(pool: &SqlitePool, queue: &str, now: DateTime<Utc>) -> Result<QueueDepth> {
    let (ready, delayed, in_flight): (i64, i64, i64) = sqlx::query_as(
        r#"
        select
            count(*) filter (where available_at_utc <= ?2
                             and (locked_until_utc is null or locked_until_utc < ?2)),
            count(*) filter (where available_at_utc > ?2),
            count(*) filter (where locked_until_utc is not null and locked_until_utc >= ?2)
        from queue_messages where queue_name = ?1
        "#,
    )
    .bind(queue)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("queue_depth failed")?;

    let (dead,): (i64,) =
        sqlx::query_as("select count(*) from queue_dead_letters where queue_name = ?1")
            .bind(queue)
            .fetch_one(pool)
            .await
            .context("queue_depth dead count failed")?;

    Ok(QueueDepth {
        ready,
        delayed,
        in_flight,
        dead,
    })
}

pub async fn list_dead_letters(pool: &SqlitePool, queue: &str) -> Result<Vec<DeadLetterRow>> {
    sqlx::query_as::<_, DeadLetterRow>(
        r#"
        select message_id, queue_name, payload, attempts, last_error, failed_at_utc
        from queue_dead_letters
        where queue_name = ?1
        order by message_id asc
        "#,
    )
    .bind(queue)
    .fetch_all(pool)
    .await
    .context("list_dead_letters failed")
}

/// Housekeeping: drop dead letters older than the retention cutoff.
pub async fn prune_dead_letters(pool: &SqlitePool, before: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query("delete from queue_dead_letters where failed_at_utc < ?1")
        .bind(before)
        .execute(pool)
        .await
        .context("prune_dead_letters failed")?;
    Ok(res.rows_affected())
}
