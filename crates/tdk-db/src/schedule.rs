//! Fetch-schedule rows: one per tracked `(equity, quarter, year)`.
//!
//! Claiming is a single atomic UPDATE with an embedded ordered subselect; a
//! claimed row stays locked until the fetcher's completion update or lease
//! expiry, so one due row produces one `transcript_check` regardless of how
//! many scheduler ticks elapse while the poll is in flight.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, SqlitePool};

/// Priority lanes. Lower wins ties.
pub const PRIORITY_WATCHLIST: i64 = 10;
pub const PRIORITY_GROUP: i64 = 20;
pub const PRIORITY_SWEEP: i64 = 90;
pub const PRIORITY_RETIRED: i64 = 99;

#[derive(Debug, Clone, FromRow)]
pub struct ScheduleRow {
    pub row_id: i64,
    pub equity_id: i64,
    pub quarter: i64,
    pub year: i64,
    pub priority: i64,
    pub next_check_at_utc: DateTime<Utc>,
    pub last_status: Option<String>,
    pub last_checked_at_utc: Option<DateTime<Utc>>,
    pub last_available_at_utc: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub locked_until_utc: Option<DateTime<Utc>>,
}

const SCHEDULE_COLUMNS: &str = "row_id, equity_id, quarter, year, priority, next_check_at_utc, \
     last_status, last_checked_at_utc, last_available_at_utc, attempts, locked_until_utc";

/// Ensure a schedule row exists for the tracked key. An existing row keeps
/// its cadence state but its priority can only improve (a group-only equity
/// later added to the watchlist moves to the faster lane).
pub async fn ensure_row(
    pool: &SqlitePool,
    equity_id: i64,
    quarter: i64,
    year: i64,
    priority: i64,
    next_check_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into fetch_schedule
            (equity_id, quarter, year, priority, next_check_at_utc)
        values (?1, ?2, ?3, ?4, ?5)
        on conflict (equity_id, quarter, year) do update
            set priority = min(fetch_schedule.priority, excluded.priority)
        "#,
    )
    .bind(equity_id)
    .bind(quarter)
    .bind(year)
    .bind(priority)
    .bind(next_check_at)
    .execute(pool)
    .await
    .context("ensure_row failed")?;
    Ok(())
}

pub async fn fetch_row(pool: &SqlitePool, row_id: i64) -> Result<Option<ScheduleRow>> {
    let sql = format!("select {SCHEDULE_COLUMNS} from fetch_schedule where row_id = ?1");
    sqlx::query_as::<_, ScheduleRow>(&sql)
        .bind(row_id)
        .fetch_optional(pool)
        .await
        .context("fetch_row failed")
}

/// Atomically claim up to `limit` due rows.
///
/// A row is claimable iff `next_check_at ≤ now` and its lock is absent or
/// expired. Claim order is `(priority asc, next_check_at asc)`; the rows come
/// back re-sorted the same way because RETURNING order is unspecified.
pub async fn claim_due(
    pool: &SqlitePool,
    limit: i64,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<Vec<ScheduleRow>> {
    let locked_until = now + lease;
    let sql = format!(
        r#"
        update fetch_schedule
           set locked_until_utc = ?1
         where row_id in (
             select row_id from fetch_schedule
             where next_check_at_utc <= ?2
               and (locked_until_utc is null or locked_until_utc < ?2)
             order by priority asc, next_check_at_utc asc
             limit ?3
         )
        returning {SCHEDULE_COLUMNS}
        "#
    );
    let mut rows = sqlx::query_as::<_, ScheduleRow>(&sql)
        .bind(locked_until)
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("claim_due failed")?;

    rows.sort_by(|a, b| {
        (a.priority, a.next_check_at_utc, a.row_id).cmp(&(b.priority, b.next_check_at_utc, b.row_id))
    });
    Ok(rows)
}

/// Completion update after a successful poll: records the observed status,
/// resets the error streak, schedules the next check, and clears the lock.
pub async fn complete_check(
    pool: &SqlitePool,
    row_id: i64,
    last_status: &str,
    next_check_at: DateTime<Utc>,
    observed_available: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update fetch_schedule
           set last_status = ?2,
               last_checked_at_utc = ?3,
               last_available_at_utc = case when ?4 then ?3 else last_available_at_utc end,
               attempts = 0,
               next_check_at_utc = ?5,
               locked_until_utc = null
         where row_id = ?1
        "#,
    )
    .bind(row_id)
    .bind(last_status)
    .bind(now)
    .bind(observed_available)
    .bind(next_check_at)
    .execute(pool)
    .await
    .context("complete_check failed")?;
    Ok(())
}

/// Transient-error update: bumps the error streak and backs the row off
/// without touching `last_status`. Returns the new attempt count.
pub async fn bump_transient_error(
    pool: &SqlitePool,
    row_id: i64,
    next_check_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<i64> {
    let (attempts,): (i64,) = sqlx::query_as(
        r#"
        update fetch_schedule
           set attempts = attempts + 1,
               last_checked_at_utc = ?2,
               next_check_at_utc = ?3,
               locked_until_utc = null
         where row_id = ?1
        returning attempts
        "#,
    )
    .bind(row_id)
    .bind(now)
    .bind(next_check_at)
    .fetch_one(pool)
    .await
    .context("bump_transient_error failed")?;
    Ok(attempts)
}

/// Permanent-error update: the row is parked for a day and surfaces
/// `last_status = 'error'` to the UI.
pub async fn mark_permanent_error(
    pool: &SqlitePool,
    row_id: i64,
    next_check_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update fetch_schedule
           set last_status = 'error',
               last_checked_at_utc = ?2,
               attempts = 0,
               next_check_at_utc = ?3,
               locked_until_utc = null
         where row_id = ?1
        "#,
    )
    .bind(row_id)
    .bind(now)
    .bind(next_check_at)
    .execute(pool)
    .await
    .context("mark_permanent_error failed")?;
    Ok(())
}

/// Soft-retire rows whose transcript went available more than the retention
/// window ago: priority drops to the retired lane and the cadence stretches
/// to a week. Returns the number of rows retired.
pub async fn retire_stale(
    pool: &SqlitePool,
    available_before: DateTime<Utc>,
    next_check_at: DateTime<Utc>,
) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update fetch_schedule
           set priority = ?1,
               next_check_at_utc = ?3
         where priority < ?1
           and last_available_at_utc is not null
           and last_available_at_utc < ?2
        "#,
    )
    .bind(PRIORITY_RETIRED)
    .bind(available_before)
    .bind(next_check_at)
    .execute(pool)
    .await
    .context("retire_stale failed")?;
    Ok(res.rows_affected())
}

/// Remove schedule rows for equities that left all tracked sets.
pub async fn delete_untracked(pool: &SqlitePool) -> Result<u64> {
    let res = sqlx::query(
        r#"
        delete from fetch_schedule
         where equity_id not in (
             select equity_id from watchlist
             union
             select m.equity_id from group_members m
             join groups g on g.group_id = m.group_id
             where g.is_active = 1
         )
        "#,
    )
    .execute(pool)
    .await
    .context("delete_untracked failed")?;
    Ok(res.rows_affected())
}

/// All rows, dispatch-ordered — backs the admin read model.
pub async fn list_rows(pool: &SqlitePool) -> Result<Vec<ScheduleRow>> {
    let sql = format!(
        "select {SCHEDULE_COLUMNS} from fetch_schedule \
         order by priority asc, next_check_at_utc asc"
    );
    sqlx::query_as::<_, ScheduleRow>(&sql)
        .fetch_all(pool)
        .await
        .context("list_rows failed")
}

/// Earliest due time among unlocked rows — the status endpoint's
/// `next_poll_at`.
pub async fn next_due_at(pool: &SqlitePool) -> Result<Option<DateTime<Utc>>> {
    let (next,): (Option<DateTime<Utc>>,) = sqlx::query_as(
        "select min(next_check_at_utc) from fetch_schedule where locked_until_utc is null",
    )
    .fetch_one(pool)
    .await
    .context("next_due_at failed")?;
    Ok(next)
}
