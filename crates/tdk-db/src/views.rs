//! Derived read models for the admin surface.
//!
//! Projections over the durable entities only — there is no separate
//! in-flight table; "retrying" and friends come straight from attempts and
//! retry horizons.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

/// Per-equity pipeline state for one `(quarter, year)`.
#[derive(Debug, Clone, FromRow)]
pub struct PipelineEquityRow {
    pub equity_id: i64,
    pub symbol: String,
    pub on_watchlist: bool,
    pub transcript_status: Option<String>,
    pub analysis_status: Option<String>,
    pub schedule_attempts: Option<i64>,
    pub next_check_at_utc: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
}

pub async fn pipeline_overview(
    pool: &SqlitePool,
    quarter: i64,
    year: i64,
) -> Result<Vec<PipelineEquityRow>> {
    sqlx::query_as::<_, PipelineEquityRow>(
        r#"
        select e.equity_id,
               e.symbol,
               exists (select 1 from watchlist w where w.equity_id = e.equity_id)
                   as on_watchlist,
               t.status as transcript_status,
               t.analysis_status,
               s.attempts as schedule_attempts,
               s.next_check_at_utc,
               s.last_status
        from equities e
        left join transcripts t
               on t.equity_id = e.equity_id and t.quarter = ?1 and t.year = ?2
        left join fetch_schedule s
               on s.equity_id = e.equity_id and s.quarter = ?1 and s.year = ?2
        where exists (select 1 from watchlist w where w.equity_id = e.equity_id)
           or exists (select 1 from group_members m
                      join groups g on g.group_id = m.group_id
                      where m.equity_id = e.equity_id and g.is_active = 1)
        order by e.equity_id asc
        "#,
    )
    .bind(quarter)
    .bind(year)
    .fetch_all(pool)
    .await
    .context("pipeline_overview failed")
}
