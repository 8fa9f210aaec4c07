//! Scenario: transcript status and source URL are sticky.
//!
//! Once a transcript is `available` with a URL, later `upcoming`/`none`
//! observations must not regress the row, and a different URL from a later
//! poll must not displace the first one. The event log's partial uniqueness
//! is the replay gate for URL-carrying observations.

use chrono::{Duration, TimeZone, Utc};
use tdk_db::transcripts::{self, TranscriptStatus};
use tempfile::TempDir;

async fn make_pool() -> anyhow::Result<(TempDir, sqlx::SqlitePool)> {
    let dir = tempfile::tempdir()?;
    let pool = tdk_db::connect(&dir.path().join("pipeline.db")).await?;
    tdk_db::migrate(&pool).await?;
    Ok((dir, pool))
}

#[tokio::test]
async fn available_does_not_regress_to_upcoming() -> anyhow::Result<()> {
    let (_dir, pool) = make_pool().await?;
    let equity_id =
        tdk_db::universe::upsert_equity(&pool, "ACME", None, "US-ACME", "Acme Corp").await?;

    let now = Utc.with_ymd_and_hms(2026, 7, 10, 9, 0, 0).unwrap();
    let row = transcripts::upsert_available(
        &pool, equity_id, 2, 2026, "https://host/t/q2.html", None, now,
    )
    .await?;
    assert_eq!(row.status, "available");

    let later = now + Duration::hours(1);
    let row = transcripts::upsert_upcoming(&pool, equity_id, 2, 2026, None, later).await?;
    assert_eq!(row.status, "available", "upcoming must not displace available");
    assert_eq!(row.source_url.as_deref(), Some("https://host/t/q2.html"));
    Ok(())
}

#[tokio::test]
async fn first_source_url_sticks() -> anyhow::Result<()> {
    let (_dir, pool) = make_pool().await?;
    let equity_id =
        tdk_db::universe::upsert_equity(&pool, "ACME", None, "US-ACME", "Acme Corp").await?;

    let now = Utc.with_ymd_and_hms(2026, 7, 10, 9, 0, 0).unwrap();
    transcripts::upsert_available(&pool, equity_id, 2, 2026, "https://host/a", None, now).await?;
    let row =
        transcripts::upsert_available(&pool, equity_id, 2, 2026, "https://host/b", None, now)
            .await?;
    assert_eq!(
        row.source_url.as_deref(),
        Some("https://host/a"),
        "a poll must not replace the recorded URL"
    );
    Ok(())
}

#[tokio::test]
async fn url_events_dedupe_but_plain_events_append() -> anyhow::Result<()> {
    let (_dir, pool) = make_pool().await?;
    let equity_id =
        tdk_db::universe::upsert_equity(&pool, "ACME", None, "US-ACME", "Acme Corp").await?;
    let now = Utc.with_ymd_and_hms(2026, 7, 10, 9, 0, 0).unwrap();

    let first = transcripts::record_event(
        &pool,
        equity_id,
        2,
        2026,
        TranscriptStatus::Available,
        Some("https://host/a"),
        None,
        "poll",
        now,
    )
    .await?;
    let replay = transcripts::record_event(
        &pool,
        equity_id,
        2,
        2026,
        TranscriptStatus::Available,
        Some("https://host/a"),
        None,
        "poll",
        now + Duration::minutes(10),
    )
    .await?;
    assert!(first, "first URL observation must insert");
    assert!(!replay, "replayed URL observation must dedupe");

    // `none` observations have no URL and always append.
    for i in 0..3 {
        let appended = transcripts::record_event(
            &pool,
            equity_id,
            2,
            2026,
            TranscriptStatus::None,
            None,
            None,
            "poll",
            now + Duration::hours(i),
        )
        .await?;
        assert!(appended);
    }
    Ok(())
}
