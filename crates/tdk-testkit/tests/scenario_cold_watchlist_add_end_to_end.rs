//! Scenario: cold watchlist add.
//!
//! Insert an equity, observe `upcoming` then `available`, and follow the
//! work all the way to sent notification emails: check → analysis →
//! outbox, with the 10-minute cadence once the event is inside 24 hours.

use chrono::{Duration, TimeZone, Utc};
use tdk_fetcher::OracleObservation;
use tdk_testkit::Harness;

#[tokio::test]
async fn upcoming_then_available_produces_one_analysis_and_sent_mail() -> anyhow::Result<()> {
    let mut h = Harness::new().await?;
    let t0 = Utc.with_ymd_and_hms(2026, 8, 3, 9, 0, 0).unwrap();

    let equity_id = h.add_watched_equity("ACME", "US-ACME", t0).await?;
    h.add_recipient("pm@desk.test", t0).await?;
    h.add_recipient("analyst@desk.test", t0).await?;

    let url = h
        .serve_transcript(
            "/t/acme-q2.html",
            "<html><p>Operator: good afternoon.</p><p>CEO: record quarter.</p></html>",
        )
        .await;
    let event_date = t0 + Duration::minutes(30);
    h.oracle.push(
        "US-ACME",
        Ok(OracleObservation::Upcoming {
            event_date: Some(event_date),
        }),
    );
    h.oracle.push_available("US-ACME", &url);

    // First tick: the new watchlist row dispatches immediately.
    let t1 = t0 + Duration::seconds(1);
    let report = h.scheduler_tick(t1).await?;
    assert_eq!(report.dispatched, 1);
    assert_eq!(h.fetch_pass(t1).await?, 1);

    // Event inside 24 h → 10-minute lane (plus ≤20% jitter).
    let row = &tdk_db::schedule::list_rows(&h.pool).await?[0];
    assert_eq!(row.last_status.as_deref(), Some("upcoming"));
    let delta = row.next_check_at_utc - t1;
    assert!(delta >= Duration::minutes(10), "cadence too fast: {delta}");
    assert!(delta <= Duration::minutes(12), "cadence too slow: {delta}");

    // Second poll at the cadence horizon: transcript is out.
    let t2 = row.next_check_at_utc;
    assert_eq!(h.scheduler_tick(t2).await?.dispatched, 1);
    assert_eq!(h.fetch_pass(t2).await?, 1);
    h.settle(t2).await?;

    // Exactly one committed analysis on the watched transcript.
    let transcript = tdk_db::transcripts::fetch_transcript_by_key(&h.pool, equity_id, 2, 2026)
        .await?
        .expect("transcript row must exist");
    assert_eq!(transcript.status, "available");
    assert_eq!(transcript.analysis_status.as_deref(), Some("done"));
    assert_eq!(
        tdk_db::analyses::count_for_transcript(&h.pool, transcript.transcript_id).await?,
        1
    );

    // One sent notification per active recipient.
    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 2);
    let mut recipients: Vec<&str> = sent.iter().map(|s| s.to.as_str()).collect();
    recipients.sort_unstable();
    assert_eq!(recipients, vec!["analyst@desk.test", "pm@desk.test"]);
    assert!(sent[0].subject.contains("ACME Q2 2026"));

    // Row stays warm on the daily lane with the availability recorded.
    let row = &tdk_db::schedule::list_rows(&h.pool).await?[0];
    assert_eq!(row.last_status.as_deref(), Some("available"));
    assert!(row.last_available_at_utc.is_some());
    assert!(row.next_check_at_utc - t2 >= Duration::hours(24));
    Ok(())
}
