//! Scenario: group fan-in.
//!
//! A three-member group produces no research run until the last member's
//! analysis lands; then exactly one run reaches `done`. Analyses arriving
//! later never re-open it.

use chrono::{Duration, TimeZone, Utc};
use tdk_testkit::Harness;

async fn member_count_done(h: &Harness, equity_id: i64) -> anyhow::Result<bool> {
    let t = tdk_db::transcripts::fetch_transcript_by_key(&h.pool, equity_id, 2, 2026).await?;
    Ok(match t {
        Some(t) => t.analysis_status.as_deref() == Some("done"),
        None => false,
    })
}

#[tokio::test]
async fn run_opens_only_when_every_member_is_done() -> anyhow::Result<()> {
    let mut h = Harness::new().await?;
    // August 2026 → target quarter Q2 2026.
    let t0 = Utc.with_ymd_and_hms(2026, 8, 3, 9, 0, 0).unwrap();

    let e1 = h.add_equity("ALPHA", "US-ALPHA").await?;
    let e2 = h.add_equity("BRAVO", "US-BRAVO").await?;
    let e3 = h.add_equity("CHARLIE", "US-CHARLIE").await?;
    let group_id = tdk_db::universe::create_group(
        &h.pool,
        "industrials",
        Some("Write a cross-company research article for the quarter."),
        None,
    )
    .await?;
    for equity_id in [e1, e2, e3] {
        tdk_db::universe::group_add_member(&h.pool, group_id, equity_id, t0).await?;
    }

    let u1 = h.serve_transcript("/t/alpha.html", "Alpha call.").await;
    let u2 = h.serve_transcript("/t/bravo.html", "Bravo call.").await;
    let u3 = h.serve_transcript("/t/charlie.html", "Charlie call.").await;

    // Phase 1: only ALPHA reports.
    h.oracle.push_available("US-ALPHA", &u1);
    h.scheduler_tick(t0).await?;
    h.settle(t0).await?;
    assert!(member_count_done(&h, e1).await?);
    assert!(
        tdk_db::research::fetch_run(&h.pool, group_id, 2, 2026).await?.is_none(),
        "one member done must not open the run"
    );

    // Phase 2: BRAVO reports on the next polling window.
    let t1 = t0 + Duration::hours(7);
    h.oracle.push_available("US-BRAVO", &u2);
    h.scheduler_tick(t1).await?;
    h.settle(t1).await?;
    assert!(member_count_done(&h, e2).await?);
    assert!(
        tdk_db::research::fetch_run(&h.pool, group_id, 2, 2026).await?.is_none(),
        "two of three members must not open the run"
    );

    // Phase 3: CHARLIE completes the set.
    let t2 = t0 + Duration::hours(14);
    h.oracle.push_available("US-CHARLIE", &u3);
    h.scheduler_tick(t2).await?;
    h.settle(t2).await?;

    let run = tdk_db::research::fetch_run(&h.pool, group_id, 2, 2026)
        .await?
        .expect("fan-in satisfied; run must exist");
    assert_eq!(run.status, "done");
    assert!(run.output_text.as_deref().unwrap_or("").starts_with("Scripted summary"));
    assert_eq!(
        run.prompt_snapshot.as_deref(),
        Some("Write a cross-company research article for the quarter.")
    );

    // Group-only members never notify recipients.
    assert!(h.mailer.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn done_run_is_frozen_against_later_member_signals() -> anyhow::Result<()> {
    let mut h = Harness::new().await?;
    let t0 = Utc.with_ymd_and_hms(2026, 8, 3, 9, 0, 0).unwrap();

    let e1 = h.add_equity("ALPHA", "US-ALPHA").await?;
    let group_id =
        tdk_db::universe::create_group(&h.pool, "solo", Some("Write the article."), None).await?;
    tdk_db::universe::group_add_member(&h.pool, group_id, e1, t0).await?;

    let u1 = h.serve_transcript("/t/alpha.html", "Alpha call.").await;
    h.oracle.push_available("US-ALPHA", &u1);
    h.scheduler_tick(t0).await?;
    h.settle(t0).await?;

    let run = tdk_db::research::fetch_run(&h.pool, group_id, 2, 2026).await?.unwrap();
    assert_eq!(run.status, "done");
    let first_updated = run.updated_at_utc;
    let model_calls = h.model.call_count();

    // A forced re-analysis of the member completes and signals again...
    let transcript =
        tdk_db::transcripts::fetch_transcript_by_key(&h.pool, e1, 2, 2026).await?.unwrap();
    let key = tdk_db::jobs::idempotency_key(transcript.transcript_id, &u1, 1);
    tdk_db::jobs::insert_job_deduped(&h.pool, transcript.transcript_id, &key, true, t0).await?;
    h.broker
        .publish(
            tdk_queue::names::ANALYSIS_REQUEST,
            &tdk_schemas::AnalysisRequest {
                transcript_id: transcript.transcript_id,
                source_url: u1.clone(),
                force: true,
                idempotency_key: key,
            },
            Duration::zero(),
            t0,
        )
        .await?;
    let t1 = t0 + Duration::minutes(5);
    h.settle(t1).await?;

    // ...but the done run stays frozen (no re-open without force).
    let run = tdk_db::research::fetch_run(&h.pool, group_id, 2, 2026).await?.unwrap();
    assert_eq!(run.status, "done");
    assert_eq!(run.updated_at_utc, first_updated);
    // Model ran once more for the re-analysis, not for the article.
    assert_eq!(h.model.call_count(), model_calls + 1);
    Ok(())
}
