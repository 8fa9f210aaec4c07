//! Scenario: broker delivery semantics.
//!
//! Covers the visibility contract end to end: delayed delivery, FIFO order,
//! lease redelivery with attempt accounting, and dead-lettering at the
//! attempt cap.

use chrono::{Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tdk_queue::{NackOutcome, QueueBroker, QueuePolicy};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Probe {
    seq: i64,
}

async fn make_broker() -> anyhow::Result<(TempDir, QueueBroker)> {
    let dir = tempfile::tempdir()?;
    let pool = tdk_db::connect(&dir.path().join("pipeline.db")).await?;
    tdk_db::migrate(&pool).await?;
    Ok((dir, QueueBroker::new(pool)))
}

#[tokio::test]
async fn delayed_message_is_invisible_until_available_at() -> anyhow::Result<()> {
    let (_dir, broker) = make_broker().await?;
    let now = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();

    broker.publish("q", &Probe { seq: 1 }, Duration::minutes(10), now).await?;

    assert!(broker.claim("q", 10, now).await?.is_empty());
    assert!(broker
        .claim("q", 10, now + Duration::minutes(9))
        .await?
        .is_empty());

    let due = broker.claim("q", 10, now + Duration::minutes(10)).await?;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].decode::<Probe>()?.seq, 1);
    Ok(())
}

#[tokio::test]
async fn fifo_within_queue_by_available_at_then_id() -> anyhow::Result<()> {
    let (_dir, broker) = make_broker().await?;
    let now = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();

    // Same available_at → id order breaks the tie.
    broker.publish("q", &Probe { seq: 1 }, Duration::zero(), now).await?;
    broker.publish("q", &Probe { seq: 2 }, Duration::zero(), now).await?;
    // Earlier available_at published later still sorts first.
    broker
        .publish("q", &Probe { seq: 0 }, Duration::zero(), now - Duration::minutes(1))
        .await?;

    let claimed = broker.claim("q", 10, now).await?;
    let seqs: Vec<i64> = claimed
        .iter()
        .map(|d| d.decode::<Probe>().unwrap().seq)
        .collect();
    assert_eq!(seqs, vec![0, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn lease_expiry_redelivers_and_counts_attempts() -> anyhow::Result<()> {
    let (_dir, broker) = make_broker().await?;
    let now = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
    broker.publish("q", &Probe { seq: 1 }, Duration::zero(), now).await?;

    let first = broker.claim("q", 1, now).await?;
    assert_eq!(first[0].attempts, 1);

    // Within the default 5-minute lease: hidden.
    assert!(broker.claim("q", 1, now + Duration::minutes(4)).await?.is_empty());

    // Past the lease: redelivered with the attempt counted.
    let second = broker.claim("q", 1, now + Duration::minutes(6)).await?;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].attempts, 2);
    assert_eq!(second[0].message_id, first[0].message_id);

    broker.ack(second[0].message_id).await?;
    assert!(broker.claim("q", 1, now + Duration::minutes(12)).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn nack_requeues_then_dead_letters_at_cap() -> anyhow::Result<()> {
    let (_dir, broker) = make_broker().await?;
    let broker = broker.with_policy(
        "q",
        QueuePolicy {
            lease: Duration::minutes(5),
            max_attempts: 2,
        },
    );
    let now = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
    broker.publish("q", &Probe { seq: 1 }, Duration::zero(), now).await?;

    let d1 = &broker.claim("q", 1, now).await?[0];
    let out1 = broker.nack(d1, Duration::seconds(30), "oracle 502", now).await?;
    assert_eq!(out1, NackOutcome::Requeued(now + Duration::seconds(30)));

    // Hidden until the backoff horizon.
    assert!(broker.claim("q", 1, now + Duration::seconds(10)).await?.is_empty());

    let t2 = now + Duration::seconds(30);
    let d2 = &broker.claim("q", 1, t2).await?[0];
    assert_eq!(d2.attempts, 2);
    let out2 = broker.nack(d2, Duration::seconds(30), "oracle 502", t2).await?;
    assert_eq!(out2, NackOutcome::DeadLettered);

    // Gone from the live set, present as a permanent error record.
    assert!(broker.claim("q", 1, t2 + Duration::hours(1)).await?.is_empty());
    let dead = tdk_db::queue::list_dead_letters(broker.pool(), "q").await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 2);
    assert_eq!(dead[0].last_error.as_deref(), Some("oracle 502"));

    let depth = broker.depth("q", t2).await?;
    assert_eq!(depth.dead, 1);
    assert_eq!(depth.ready + depth.delayed + depth.in_flight, 0);
    Ok(())
}
