//! Scenario: email transient failure retries on its horizon, permanent
//! failure parks the row as failed without blocking neighbours.

use chrono::{Duration, TimeZone, Utc};
use tdk_email::SendOutcome;
use tdk_testkit::Harness;

async fn seed_analysis_with_recipients(
    h: &mut Harness,
    recipients: &[&str],
) -> anyhow::Result<i64> {
    let t0 = Utc.with_ymd_and_hms(2026, 8, 3, 9, 0, 0).unwrap();
    h.add_watched_equity("ACME", "US-ACME", t0).await?;
    for r in recipients {
        h.add_recipient(r, t0).await?;
    }
    let url = h.serve_transcript("/t/acme.html", "Operator: welcome.").await;
    h.oracle.push_available("US-ACME", &url);
    h.scheduler_tick(t0).await?;
    h.fetch_pass(t0).await?;
    // Analysis + fan-out, but hold the email lane back for the scripts.
    h.analysis_pass(t0).await?;
    let transcript = tdk_db::transcripts::fetch_transcript_by_key(
        &h.pool,
        tdk_db::universe::fetch_equity_by_identifier(&h.pool, "US-ACME")
            .await?
            .unwrap()
            .equity_id,
        2,
        2026,
    )
    .await?
    .unwrap();
    Ok(
        tdk_db::analyses::latest_for_transcript(&h.pool, transcript.transcript_id)
            .await?
            .unwrap()
            .analysis_id,
    )
}

#[tokio::test]
async fn transient_send_failure_retries_on_the_horizon() -> anyhow::Result<()> {
    let mut h = Harness::new().await?;
    let analysis_id = seed_analysis_with_recipients(&mut h, &["pm@desk.test"]).await?;
    let t0 = Utc.with_ymd_and_hms(2026, 8, 3, 10, 0, 0).unwrap();

    h.mailer
        .push_outcome(SendOutcome::Transient("connection refused".to_string()));

    assert_eq!(h.email_pass(t0).await?, 1);
    let rows = tdk_db::outbox::list_outbox_for_analysis(&h.pool, analysis_id).await?;
    assert_eq!(rows[0].status, "pending");
    assert_eq!(rows[0].attempts, 1);
    let retry_at = rows[0].retry_next_at_utc.unwrap();
    assert_eq!((retry_at - t0).num_seconds(), 120);

    // Hidden before the horizon, sent after it.
    assert_eq!(h.email_pass(retry_at - Duration::seconds(1)).await?, 0);
    assert_eq!(h.email_pass(retry_at).await?, 1);
    let rows = tdk_db::outbox::list_outbox_for_analysis(&h.pool, analysis_id).await?;
    assert_eq!(rows[0].status, "sent");
    assert_eq!(h.mailer.sent().len(), 1);
    Ok(())
}

#[tokio::test]
async fn permanent_rejection_fails_one_row_and_spares_the_other() -> anyhow::Result<()> {
    let mut h = Harness::new().await?;
    let analysis_id =
        seed_analysis_with_recipients(&mut h, &["bad@desk.test", "good@desk.test"]).await?;
    let t0 = Utc.with_ymd_and_hms(2026, 8, 3, 10, 0, 0).unwrap();

    // First claimed row (lowest outbox_id = bad@) is rejected outright.
    h.mailer
        .push_outcome(SendOutcome::Permanent("550 no such user".to_string()));

    assert_eq!(h.email_pass(t0).await?, 2);
    let rows = tdk_db::outbox::list_outbox_for_analysis(&h.pool, analysis_id).await?;
    let bad = rows.iter().find(|r| r.recipient == "bad@desk.test").unwrap();
    let good = rows.iter().find(|r| r.recipient == "good@desk.test").unwrap();
    assert_eq!(bad.status, "failed");
    assert_eq!(bad.last_error.as_deref(), Some("550 no such user"));
    assert_eq!(good.status, "sent");
    assert_eq!(h.mailer.sent().len(), 1);
    Ok(())
}
