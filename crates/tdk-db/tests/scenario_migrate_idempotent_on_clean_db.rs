//! Scenario: migrations apply cleanly and are idempotent.
//!
//! A second `migrate()` against an already-migrated file must be a no-op, and
//! `status()` must report schema presence either way.

use tempfile::TempDir;

async fn make_pool() -> anyhow::Result<(TempDir, sqlx::SqlitePool)> {
    let dir = tempfile::tempdir()?;
    let pool = tdk_db::connect(&dir.path().join("pipeline.db")).await?;
    Ok((dir, pool))
}

#[tokio::test]
async fn migrate_twice_is_a_noop() -> anyhow::Result<()> {
    let (_dir, pool) = make_pool().await?;

    let before = tdk_db::status(&pool).await?;
    assert!(before.ok);
    assert!(!before.has_schema, "fresh file must not have the schema yet");

    tdk_db::migrate(&pool).await?;
    tdk_db::migrate(&pool).await?;

    let after = tdk_db::status(&pool).await?;
    assert!(after.ok);
    assert!(after.has_schema);
    Ok(())
}

#[tokio::test]
async fn core_tables_exist_after_migrate() -> anyhow::Result<()> {
    let (_dir, pool) = make_pool().await?;
    tdk_db::migrate(&pool).await?;

    for table in [
        "equities",
        "watchlist",
        "groups",
        "group_members",
        "notification_recipients",
        "transcripts",
        "transcript_events",
        "fetch_schedule",
        "queue_messages",
        "queue_dead_letters",
        "analysis_jobs",
        "transcript_analyses",
        "email_outbox",
        "group_research_runs",
    ] {
        let (exists,): (bool,) = sqlx::query_as(
            "select exists (select 1 from sqlite_master where type = 'table' and name = ?1)",
        )
        .bind(table)
        .fetch_one(&pool)
        .await?;
        assert!(exists, "table {table} must exist after migrate");
    }
    Ok(())
}
