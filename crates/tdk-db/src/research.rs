//! Group research runs and the fan-in readiness query.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::is_unique_violation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResearchStatus {
    Pending,
    InProgress,
    Done,
    Error,
}

impl ResearchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResearchStatus::Pending => "pending",
            ResearchStatus::InProgress => "in_progress",
            ResearchStatus::Done => "done",
            ResearchStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ResearchStatus::Pending),
            "in_progress" => Ok(ResearchStatus::InProgress),
            "done" => Ok(ResearchStatus::Done),
            "error" => Ok(ResearchStatus::Error),
            other => Err(anyhow!("invalid research status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ResearchRunRow {
    pub run_id: i64,
    pub group_id: i64,
    pub quarter: i64,
    pub year: i64,
    pub status: String,
    pub prompt_snapshot: Option<String>,
    pub output_text: Option<String>,
    pub model_provider: Option<String>,
    pub model_id: Option<String>,
    pub model_revision: Option<String>,
    pub error_message: Option<String>,
    pub created_at_utc: DateTime<Utc>,
    pub updated_at_utc: DateTime<Utc>,
}

/// One member's contribution to the research digest.
#[derive(Debug, Clone, FromRow)]
pub struct MemberAnalysis {
    pub equity_id: i64,
    pub symbol: String,
    pub name: String,
    pub quarter: i64,
    pub year: i64,
    pub output_text: String,
}

const RUN_COLUMNS: &str = "run_id, group_id, quarter, year, status, prompt_snapshot, \
     output_text, model_provider, model_id, model_revision, error_message, \
     created_at_utc, updated_at_utc";

/// Fan-in readiness: every current member of the group has an `available`
/// transcript for the quarter with at least one stored analysis. Groups with
/// no members are never ready.
pub async fn fan_in_ready(
    pool: &SqlitePool,
    group_id: i64,
    quarter: i64,
    year: i64,
) -> Result<bool> {
    let (ready,): (bool,) = sqlx::query_as(
        r#"
        select exists (select 1 from group_members m where m.group_id = ?1)
           and not exists (
               select 1 from group_members m
               where m.group_id = ?1
                 and not exists (
                     select 1 from transcripts t
                     join transcript_analyses a on a.transcript_id = t.transcript_id
                     where t.equity_id = m.equity_id
                       and t.quarter = ?2 and t.year = ?3
                       and t.status = 'available'
                 )
           )
        "#,
    )
    .bind(group_id)
    .bind(quarter)
    .bind(year)
    .fetch_one(pool)
    .await
    .context("fan_in_ready failed")?;
    Ok(ready)
}

/// Member equities with no stored analysis for the quarter — the set a forced
/// run will skip.
pub async fn missing_members(
    pool: &SqlitePool,
    group_id: i64,
    quarter: i64,
    year: i64,
) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        select m.equity_id from group_members m
        where m.group_id = ?1
          and not exists (
              select 1 from transcripts t
              join transcript_analyses a on a.transcript_id = t.transcript_id
              where t.equity_id = m.equity_id
                and t.quarter = ?2 and t.year = ?3
                and t.status = 'available'
          )
        order by m.equity_id asc
        "#,
    )
    .bind(group_id)
    .bind(quarter)
    .bind(year)
    .fetch_all(pool)
    .await
    .context("missing_members failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// The latest analysis per member for the quarter, the digest input for the
/// research prompt. Members without an analysis are absent (forced runs skip
/// them).
pub async fn member_digest(
    pool: &SqlitePool,
    group_id: i64,
    quarter: i64,
    year: i64,
) -> Result<Vec<MemberAnalysis>> {
    sqlx::query_as::<_, MemberAnalysis>(
        r#"
        select e.equity_id, e.symbol, e.name, t.quarter, t.year, a.output_text
        from group_members m
        join equities e on e.equity_id = m.equity_id
        join transcripts t on t.equity_id = m.equity_id
                          and t.quarter = ?2 and t.year = ?3
        join transcript_analyses a on a.analysis_id = (
            select max(a2.analysis_id) from transcript_analyses a2
            where a2.transcript_id = t.transcript_id
        )
        where m.group_id = ?1
        order by e.equity_id asc
        "#,
    )
    .bind(group_id)
    .bind(quarter)
    .bind(year)
    .fetch_all(pool)
    .await
    .context("member_digest failed")
}

/// Create the `pending` run exactly once per `(group, quarter, year)`.
/// Returns `Ok(None)` when the run already exists.
pub async fn insert_run_deduped(
    pool: &SqlitePool,
    group_id: i64,
    quarter: i64,
    year: i64,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let res: Result<(i64,), sqlx::Error> = sqlx::query_as(
        r#"
        insert into group_research_runs (group_id, quarter, year, created_at_utc, updated_at_utc)
        values (?1, ?2, ?3, ?4, ?4)
        returning run_id
        "#,
    )
    .bind(group_id)
    .bind(quarter)
    .bind(year)
    .bind(now)
    .fetch_one(pool)
    .await;

    match res {
        Ok((run_id,)) => Ok(Some(run_id)),
        Err(e) if is_unique_violation(&e) => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context("insert_run_deduped failed")),
    }
}

/// Force path: create the run or re-open a terminal one back to `pending`.
pub async fn reopen_run(
    pool: &SqlitePool,
    group_id: i64,
    quarter: i64,
    year: i64,
    now: DateTime<Utc>,
) -> Result<i64> {
    let (run_id,): (i64,) = sqlx::query_as(
        r#"
        insert into group_research_runs (group_id, quarter, year, created_at_utc, updated_at_utc)
        values (?1, ?2, ?3, ?4, ?4)
        on conflict (group_id, quarter, year) do update
            set status = 'pending',
                error_message = null,
                updated_at_utc = excluded.updated_at_utc
        returning run_id
        "#,
    )
    .bind(group_id)
    .bind(quarter)
    .bind(year)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("reopen_run failed")?;
    Ok(run_id)
}

/// CAS `pending → in_progress`. Without `force`, a run in any other state is
/// rejected (`Ok(None)`); with `force`, any state transitions.
pub async fn run_begin(
    pool: &SqlitePool,
    group_id: i64,
    quarter: i64,
    year: i64,
    force: bool,
    now: DateTime<Utc>,
) -> Result<Option<ResearchRunRow>> {
    let sql = format!(
        r#"
        update group_research_runs
           set status = 'in_progress',
               updated_at_utc = ?5
         where group_id = ?1 and quarter = ?2 and year = ?3
           and (status = 'pending' or ?4)
        returning {RUN_COLUMNS}
        "#
    );
    sqlx::query_as::<_, ResearchRunRow>(&sql)
        .bind(group_id)
        .bind(quarter)
        .bind(year)
        .bind(force)
        .bind(now)
        .fetch_optional(pool)
        .await
        .context("run_begin failed")
}

/// Transient failure mid-run: hand the run back to `pending` so the retried
/// dispatch can begin it again without force.
pub async fn run_revert_pending(pool: &SqlitePool, run_id: i64, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        update group_research_runs
           set status = 'pending',
               updated_at_utc = ?2
         where run_id = ?1 and status = 'in_progress'
        "#,
    )
    .bind(run_id)
    .bind(now)
    .execute(pool)
    .await
    .context("run_revert_pending failed")?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn run_complete(
    pool: &SqlitePool,
    run_id: i64,
    prompt_snapshot: &str,
    output_text: &str,
    model_provider: &str,
    model_id: &str,
    model_revision: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update group_research_runs
           set status = 'done',
               prompt_snapshot = ?2,
               output_text = ?3,
               model_provider = ?4,
               model_id = ?5,
               model_revision = ?6,
               error_message = null,
               updated_at_utc = ?7
         where run_id = ?1
        "#,
    )
    .bind(run_id)
    .bind(prompt_snapshot)
    .bind(output_text)
    .bind(model_provider)
    .bind(model_id)
    .bind(model_revision)
    .bind(now)
    .execute(pool)
    .await
    .context("run_complete failed")?;
    Ok(())
}

pub async fn run_fail(
    pool: &SqlitePool,
    run_id: i64,
    error: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update group_research_runs
           set status = 'error',
               error_message = ?2,
               updated_at_utc = ?3
         where run_id = ?1
        "#,
    )
    .bind(run_id)
    .bind(error)
    .bind(now)
    .execute(pool)
    .await
    .context("run_fail failed")?;
    Ok(())
}

pub async fn fetch_run(
    pool: &SqlitePool,
    group_id: i64,
    quarter: i64,
    year: i64,
) -> Result<Option<ResearchRunRow>> {
    let sql = format!(
        "select {RUN_COLUMNS} from group_research_runs \
         where group_id = ?1 and quarter = ?2 and year = ?3"
    );
    sqlx::query_as::<_, ResearchRunRow>(&sql)
        .bind(group_id)
        .bind(quarter)
        .bind(year)
        .fetch_optional(pool)
        .await
        .context("fetch_run failed")
}
