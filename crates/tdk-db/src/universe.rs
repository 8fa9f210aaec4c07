//! Equity universe, watchlist, groups, and the notification recipient list.
//!
//! Ingestion of the universe itself is external (CSV import feeds
//! `upsert_equity`); everything here is thin CRUD plus the tracked-set
//! queries the scheduler derives its schedule rows from.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::is_unique_violation;

#[derive(Debug, Clone, FromRow)]
pub struct EquityRow {
    pub equity_id: i64,
    pub symbol: String,
    pub alt_code: Option<String>,
    pub identifier: String,
    pub name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct GroupRow {
    pub group_id: i64,
    pub name: String,
    pub deep_research_prompt: Option<String>,
    pub stock_summary_prompt: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct RecipientRow {
    pub recipient_id: i64,
    pub email: String,
    pub is_active: bool,
}

/// One member of the tracked set (watchlist ∪ active-group members) with the
/// flags that decide its schedule priority.
#[derive(Debug, Clone, FromRow)]
pub struct TrackedEquity {
    pub equity_id: i64,
    pub on_watchlist: bool,
    pub in_active_group: bool,
}

/// Insert or refresh an equity keyed by its external identifier.
pub async fn upsert_equity(
    pool: &SqlitePool,
    symbol: &str,
    alt_code: Option<&str>,
    identifier: &str,
    name: &str,
) -> Result<i64> {
    let (equity_id,): (i64,) = sqlx::query_as(
        r#"
        insert into equities (symbol, alt_code, identifier, name)
        values (?1, ?2, ?3, ?4)
        on conflict (identifier) do update
            set symbol = excluded.symbol,
                alt_code = excluded.alt_code,
                name = excluded.name
        returning equity_id
        "#,
    )
    .bind(symbol)
    .bind(alt_code)
    .bind(identifier)
    .bind(name)
    .fetch_one(pool)
    .await
    .context("upsert_equity failed")?;

    Ok(equity_id)
}

pub async fn fetch_equity(pool: &SqlitePool, equity_id: i64) -> Result<Option<EquityRow>> {
    sqlx::query_as::<_, EquityRow>(
        "select equity_id, symbol, alt_code, identifier, name from equities where equity_id = ?1",
    )
    .bind(equity_id)
    .fetch_optional(pool)
    .await
    .context("fetch_equity failed")
}

pub async fn fetch_equity_by_identifier(
    pool: &SqlitePool,
    identifier: &str,
) -> Result<Option<EquityRow>> {
    sqlx::query_as::<_, EquityRow>(
        "select equity_id, symbol, alt_code, identifier, name from equities where identifier = ?1",
    )
    .bind(identifier)
    .fetch_optional(pool)
    .await
    .context("fetch_equity_by_identifier failed")
}

// ---------------------------------------------------------------------------
// Watchlist
// ---------------------------------------------------------------------------

/// Add an equity to the watchlist. Returns `Ok(false)` if it was already
/// present (idempotent user action).
pub async fn watchlist_add(
    pool: &SqlitePool,
    equity_id: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "insert into watchlist (equity_id, added_at_utc) values (?1, ?2)",
    )
    .bind(equity_id)
    .bind(now)
    .execute(pool)
    .await;

    match res {
        Ok(_) => Ok(true),
        Err(e) if is_unique_violation(&e) => Ok(false),
        Err(e) => Err(anyhow::Error::new(e).context("watchlist_add failed")),
    }
}

pub async fn watchlist_remove(pool: &SqlitePool, equity_id: i64) -> Result<bool> {
    let res = sqlx::query("delete from watchlist where equity_id = ?1")
        .bind(equity_id)
        .execute(pool)
        .await
        .context("watchlist_remove failed")?;
    Ok(res.rows_affected() > 0)
}

pub async fn is_on_watchlist(pool: &SqlitePool, equity_id: i64) -> Result<bool> {
    let (exists,): (bool,) =
        sqlx::query_as("select exists (select 1 from watchlist where equity_id = ?1)")
            .bind(equity_id)
            .fetch_one(pool)
            .await
            .context("is_on_watchlist failed")?;
    Ok(exists)
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

pub async fn create_group(
    pool: &SqlitePool,
    name: &str,
    deep_research_prompt: Option<&str>,
    stock_summary_prompt: Option<&str>,
) -> Result<i64> {
    let (group_id,): (i64,) = sqlx::query_as(
        r#"
        insert into groups (name, deep_research_prompt, stock_summary_prompt, is_active)
        values (?1, ?2, ?3, 1)
        returning group_id
        "#,
    )
    .bind(name)
    .bind(deep_research_prompt)
    .bind(stock_summary_prompt)
    .fetch_one(pool)
    .await
    .context("create_group failed")?;
    Ok(group_id)
}

pub async fn set_group_active(pool: &SqlitePool, group_id: i64, active: bool) -> Result<()> {
    sqlx::query("update groups set is_active = ?2 where group_id = ?1")
        .bind(group_id)
        .bind(active)
        .execute(pool)
        .await
        .context("set_group_active failed")?;
    Ok(())
}

pub async fn fetch_group(pool: &SqlitePool, group_id: i64) -> Result<Option<GroupRow>> {
    sqlx::query_as::<_, GroupRow>(
        r#"
        select group_id, name, deep_research_prompt, stock_summary_prompt, is_active
        from groups where group_id = ?1
        "#,
    )
    .bind(group_id)
    .fetch_optional(pool)
    .await
    .context("fetch_group failed")
}

/// Add a member. Returns `Ok(false)` if already a member.
pub async fn group_add_member(
    pool: &SqlitePool,
    group_id: i64,
    equity_id: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        insert into group_members (group_id, equity_id, added_at_utc, updated_at_utc)
        values (?1, ?2, ?3, ?3)
        "#,
    )
    .bind(group_id)
    .bind(equity_id)
    .bind(now)
    .execute(pool)
    .await;

    match res {
        Ok(_) => Ok(true),
        Err(e) if is_unique_violation(&e) => Ok(false),
        Err(e) => Err(anyhow::Error::new(e).context("group_add_member failed")),
    }
}

pub async fn group_remove_member(
    pool: &SqlitePool,
    group_id: i64,
    equity_id: i64,
) -> Result<bool> {
    let res = sqlx::query("delete from group_members where group_id = ?1 and equity_id = ?2")
        .bind(group_id)
        .bind(equity_id)
        .execute(pool)
        .await
        .context("group_remove_member failed")?;
    Ok(res.rows_affected() > 0)
}

/// Active groups containing the equity, ordered by `group_id` so prompt
/// resolution is deterministic when an equity belongs to several.
pub async fn active_groups_for_equity(
    pool: &SqlitePool,
    equity_id: i64,
) -> Result<Vec<GroupRow>> {
    sqlx::query_as::<_, GroupRow>(
        r#"
        select g.group_id, g.name, g.deep_research_prompt, g.stock_summary_prompt, g.is_active
        from groups g
        join group_members m on m.group_id = g.group_id
        where m.equity_id = ?1 and g.is_active = 1
        order by g.group_id asc
        "#,
    )
    .bind(equity_id)
    .fetch_all(pool)
    .await
    .context("active_groups_for_equity failed")
}

pub async fn list_active_groups(pool: &SqlitePool) -> Result<Vec<GroupRow>> {
    sqlx::query_as::<_, GroupRow>(
        r#"
        select group_id, name, deep_research_prompt, stock_summary_prompt, is_active
        from groups where is_active = 1 order by group_id asc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_active_groups failed")
}

pub async fn group_member_ids(pool: &SqlitePool, group_id: i64) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "select equity_id from group_members where group_id = ?1 order by equity_id asc",
    )
    .bind(group_id)
    .fetch_all(pool)
    .await
    .context("group_member_ids failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

// ---------------------------------------------------------------------------
// Tracked set
// ---------------------------------------------------------------------------

/// The tracked set: every equity on the watchlist or in an active group,
/// with flags for schedule-priority derivation.
pub async fn list_tracked_equities(pool: &SqlitePool) -> Result<Vec<TrackedEquity>> {
    sqlx::query_as::<_, TrackedEquity>(
        r#"
        select e.equity_id,
               exists (select 1 from watchlist w where w.equity_id = e.equity_id)
                   as on_watchlist,
               exists (select 1 from group_members m
                       join groups g on g.group_id = m.group_id
                       where m.equity_id = e.equity_id and g.is_active = 1)
                   as in_active_group
        from equities e
        where exists (select 1 from watchlist w where w.equity_id = e.equity_id)
           or exists (select 1 from group_members m
                      join groups g on g.group_id = m.group_id
                      where m.equity_id = e.equity_id and g.is_active = 1)
        order by e.equity_id asc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_tracked_equities failed")
}

// ---------------------------------------------------------------------------
// Notification recipients
// ---------------------------------------------------------------------------

/// Add a recipient. Returns `Ok(false)` if the address is already registered.
pub async fn recipient_add(
    pool: &SqlitePool,
    email: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "insert into notification_recipients (email, is_active, added_at_utc) values (?1, 1, ?2)",
    )
    .bind(email)
    .bind(now)
    .execute(pool)
    .await;

    match res {
        Ok(_) => Ok(true),
        Err(e) if is_unique_violation(&e) => Ok(false),
        Err(e) => Err(anyhow::Error::new(e).context("recipient_add failed")),
    }
}

pub async fn recipient_set_active(pool: &SqlitePool, email: &str, active: bool) -> Result<bool> {
    let res = sqlx::query("update notification_recipients set is_active = ?2 where email = ?1")
        .bind(email)
        .bind(active)
        .execute(pool)
        .await
        .context("recipient_set_active failed")?;
    Ok(res.rows_affected() > 0)
}

pub async fn list_active_recipients(pool: &SqlitePool) -> Result<Vec<RecipientRow>> {
    sqlx::query_as::<_, RecipientRow>(
        r#"
        select recipient_id, email, is_active
        from notification_recipients
        where is_active = 1
        order by recipient_id asc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_active_recipients failed")
}
