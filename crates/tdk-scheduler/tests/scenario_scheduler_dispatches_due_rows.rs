//! Scenario: scheduler materialises windows and dispatches due rows once.
//!
//! A watchlist insert plus one tick must produce exactly one
//! `transcript_check` for the current fiscal target; further ticks within
//! the lease must not re-dispatch the same row.

use chrono::{Duration, TimeZone, Utc};
use tdk_queue::{names, QueueBroker};
use tdk_scheduler::Scheduler;
use tdk_schemas::TranscriptCheck;
use tempfile::TempDir;

async fn make_env() -> anyhow::Result<(TempDir, sqlx::SqlitePool, QueueBroker)> {
    let dir = tempfile::tempdir()?;
    let pool = tdk_db::connect(&dir.path().join("pipeline.db")).await?;
    tdk_db::migrate(&pool).await?;
    let broker = QueueBroker::new(pool.clone());
    Ok((dir, pool, broker))
}

#[tokio::test]
async fn watchlist_add_produces_one_check_for_the_target_quarter() -> anyhow::Result<()> {
    let (_dir, pool, broker) = make_env().await?;
    let now = Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap();

    let equity_id =
        tdk_db::universe::upsert_equity(&pool, "ACME", None, "US-ACME", "Acme Corp").await?;
    tdk_db::universe::watchlist_add(&pool, equity_id, now).await?;

    let mut scheduler = Scheduler::new(pool.clone(), broker.clone(), 16, 600, 1);
    let report = scheduler.tick(now).await?;
    assert!(report.windows_advanced);
    assert_eq!(report.dispatched, 1);

    let checks = broker.claim(names::TRANSCRIPT_CHECK, 10, now).await?;
    assert_eq!(checks.len(), 1);
    let check: TranscriptCheck = checks[0].decode()?;
    assert_eq!(check.equity_id, equity_id);
    // August 2026 → most recently ended quarter is Q2 2026.
    assert_eq!((check.quarter, check.year), (2, 2026));

    // Watchlist lane.
    let row = tdk_db::schedule::fetch_row(&pool, check.row_id).await?.unwrap();
    assert_eq!(row.priority, 10);
    Ok(())
}

#[tokio::test]
async fn leased_row_is_not_redispatched_by_later_ticks() -> anyhow::Result<()> {
    let (_dir, pool, broker) = make_env().await?;
    let now = Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap();

    let equity_id =
        tdk_db::universe::upsert_equity(&pool, "ACME", None, "US-ACME", "Acme Corp").await?;
    tdk_db::universe::watchlist_add(&pool, equity_id, now).await?;

    let mut scheduler = Scheduler::new(pool.clone(), broker.clone(), 16, 600, 1);
    assert_eq!(scheduler.tick(now).await?.dispatched, 1);
    assert_eq!(
        scheduler.tick(now + Duration::seconds(1)).await?.dispatched,
        0,
        "row under lease must not dispatch again"
    );
    assert_eq!(
        scheduler.tick(now + Duration::seconds(2)).await?.dispatched,
        0
    );
    Ok(())
}

#[tokio::test]
async fn group_only_members_land_on_the_slower_lane() -> anyhow::Result<()> {
    let (_dir, pool, broker) = make_env().await?;
    let now = Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap();

    let equity_id =
        tdk_db::universe::upsert_equity(&pool, "SUP", None, "US-SUP", "Supplier Inc").await?;
    let group_id = tdk_db::universe::create_group(&pool, "semis", None, None).await?;
    tdk_db::universe::group_add_member(&pool, group_id, equity_id, now).await?;

    let mut scheduler = Scheduler::new(pool.clone(), broker.clone(), 16, 600, 1);
    scheduler.tick(now).await?;

    let rows = tdk_db::schedule::list_rows(&pool).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].priority, 20);

    // Joining the watchlist later upgrades the lane in place.
    tdk_db::universe::watchlist_add(&pool, equity_id, now).await?;
    scheduler.advance_windows(now).await?;
    let rows = tdk_db::schedule::list_rows(&pool).await?;
    assert_eq!(rows[0].priority, 10);
    Ok(())
}

#[tokio::test]
async fn untracked_equities_lose_their_rows() -> anyhow::Result<()> {
    let (_dir, pool, broker) = make_env().await?;
    let now = Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap();

    let equity_id =
        tdk_db::universe::upsert_equity(&pool, "ACME", None, "US-ACME", "Acme Corp").await?;
    tdk_db::universe::watchlist_add(&pool, equity_id, now).await?;

    let mut scheduler = Scheduler::new(pool.clone(), broker.clone(), 16, 600, 1);
    scheduler.tick(now).await?;
    assert_eq!(tdk_db::schedule::list_rows(&pool).await?.len(), 1);

    tdk_db::universe::watchlist_remove(&pool, equity_id).await?;
    scheduler.advance_windows(now).await?;
    assert!(tdk_db::schedule::list_rows(&pool).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn trigger_poke_is_drained_and_forces_a_window_pass() -> anyhow::Result<()> {
    let (_dir, pool, broker) = make_env().await?;
    let now = Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap();

    broker
        .publish(
            names::SCHEDULER_TICK,
            &tdk_schemas::SchedulerTick { requested_at_utc: now },
            Duration::zero(),
            now,
        )
        .await?;

    let mut scheduler = Scheduler::new(pool.clone(), broker.clone(), 16, 600, 1);
    let report = scheduler.tick(now).await?;
    assert!(report.triggered);

    // Poke consumed: nothing left on the lane.
    assert!(broker.claim(names::SCHEDULER_TICK, 10, now + Duration::minutes(10)).await?.is_empty());
    Ok(())
}
