//! Scenario: the analysis reservation admits one holder per transcript.
//!
//! # Invariant under test
//! `try_reserve_analysis` is a CAS on `transcripts.analysis_status`; while
//! one worker holds `in_progress`, every other reserve attempt fails. A
//! committed analysis with the same idempotency key collapses onto the
//! existing row instead of duplicating.

use chrono::{TimeZone, Utc};
use tdk_db::{analyses, transcripts, NewAnalysis};
use tempfile::TempDir;

async fn make_pool() -> anyhow::Result<(TempDir, sqlx::SqlitePool)> {
    let dir = tempfile::tempdir()?;
    let pool = tdk_db::connect(&dir.path().join("pipeline.db")).await?;
    tdk_db::migrate(&pool).await?;
    Ok((dir, pool))
}

async fn seed_transcript(pool: &sqlx::SqlitePool) -> anyhow::Result<i64> {
    let equity_id =
        tdk_db::universe::upsert_equity(pool, "ACME", None, "US-ACME", "Acme Corp").await?;
    let now = Utc.with_ymd_and_hms(2026, 7, 10, 9, 0, 0).unwrap();
    let row =
        transcripts::upsert_available(pool, equity_id, 2, 2026, "https://host/a", None, now)
            .await?;
    Ok(row.transcript_id)
}

fn sample_analysis(transcript_id: i64, key: &str) -> NewAnalysis {
    NewAnalysis {
        transcript_id,
        idempotency_key: key.to_string(),
        prompt_snapshot: "summarise".to_string(),
        output_text: "strong quarter".to_string(),
        model_provider: "openai_compatible".to_string(),
        model_id: "gpt-4o-mini".to_string(),
        model_revision: None,
        tokens_in: 1200,
        tokens_out: 300,
        cost_microusd: 360,
    }
}

#[tokio::test]
async fn second_reserve_fails_until_release() -> anyhow::Result<()> {
    let (_dir, pool) = make_pool().await?;
    let transcript_id = seed_transcript(&pool).await?;

    assert!(transcripts::try_reserve_analysis(&pool, transcript_id).await?);
    assert!(
        !transcripts::try_reserve_analysis(&pool, transcript_id).await?,
        "a held reservation must reject the second worker"
    );

    assert!(transcripts::release_analysis_reservation(&pool, transcript_id).await?);
    assert!(
        transcripts::try_reserve_analysis(&pool, transcript_id).await?,
        "a released reservation must be claimable again"
    );
    Ok(())
}

#[tokio::test]
async fn reserve_allowed_again_after_done_or_error() -> anyhow::Result<()> {
    let (_dir, pool) = make_pool().await?;
    let transcript_id = seed_transcript(&pool).await?;
    let now = Utc.with_ymd_and_hms(2026, 7, 10, 10, 0, 0).unwrap();

    assert!(transcripts::try_reserve_analysis(&pool, transcript_id).await?);
    analyses::complete_analysis(&pool, &sample_analysis(transcript_id, "k1"), now).await?;

    // done → reservable (force re-analysis path).
    assert!(transcripts::try_reserve_analysis(&pool, transcript_id).await?);
    transcripts::mark_analysis_error(&pool, transcript_id, "decode failure", now).await?;

    // error → reservable (retry path).
    assert!(transcripts::try_reserve_analysis(&pool, transcript_id).await?);
    Ok(())
}

#[tokio::test]
async fn duplicate_idempotency_key_collapses_to_one_row() -> anyhow::Result<()> {
    let (_dir, pool) = make_pool().await?;
    let transcript_id = seed_transcript(&pool).await?;
    let now = Utc.with_ymd_and_hms(2026, 7, 10, 10, 0, 0).unwrap();

    let first = analyses::complete_analysis(&pool, &sample_analysis(transcript_id, "k1"), now).await?;
    let replay =
        analyses::complete_analysis(&pool, &sample_analysis(transcript_id, "k1"), now).await?;
    assert_eq!(first, replay, "replay must return the committed analysis id");
    assert_eq!(analyses::count_for_transcript(&pool, transcript_id).await?, 1);

    // A distinct key (force generation) coexists.
    let forced =
        analyses::complete_analysis(&pool, &sample_analysis(transcript_id, "k2"), now).await?;
    assert_ne!(first, forced);
    assert_eq!(analyses::count_for_transcript(&pool, transcript_id).await?, 2);

    let row = transcripts::fetch_transcript(&pool, transcript_id).await?.unwrap();
    assert_eq!(row.analysis_status.as_deref(), Some("done"));
    Ok(())
}
