//! Schedule maintenance and dispatch.
//!
//! One scheduler task per process. Each tick: drain any trigger pokes,
//! advance quarter windows when the UTC date has changed, claim due schedule
//! rows, and publish one `transcript_check` per claimed row. The scheduler
//! never calls the oracle and keeps no state outside the store — a crash
//! loses nothing and expired leases reopen anything in flight.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rand::Rng;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tdk_db::schedule::{self, PRIORITY_GROUP, PRIORITY_WATCHLIST};
use tdk_queue::{names, QueueBroker};
use tdk_schemas::TranscriptCheck;

pub mod cadence;
pub mod calendar;

pub use calendar::FiscalQuarter;

/// Snapshot surfaced by `GET /scheduler/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    pub scheduler_running: bool,
    pub is_polling: bool,
    pub poll_interval_seconds: u64,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub last_tick_at: Option<DateTime<Utc>>,
}

pub type SharedSchedulerStatus = Arc<RwLock<SchedulerStatus>>;

pub fn shared_status(poll_interval_seconds: u64) -> SharedSchedulerStatus {
    Arc::new(RwLock::new(SchedulerStatus {
        scheduler_running: false,
        is_polling: false,
        poll_interval_seconds,
        next_poll_at: None,
        last_tick_at: None,
    }))
}

/// Per-tick outcome, mostly for tests and debug logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    pub triggered: bool,
    pub windows_advanced: bool,
}

pub struct Scheduler {
    pool: SqlitePool,
    broker: QueueBroker,
    dispatch_batch: i64,
    lease: Duration,
    tick_interval: std::time::Duration,
    last_window_day: Option<NaiveDate>,
}

impl Scheduler {
    pub fn new(
        pool: SqlitePool,
        broker: QueueBroker,
        dispatch_batch: i64,
        lease_secs: i64,
        tick_interval_secs: u64,
    ) -> Self {
        Scheduler {
            pool,
            broker,
            dispatch_batch,
            lease: Duration::seconds(lease_secs),
            tick_interval: std::time::Duration::from_secs(tick_interval_secs.max(1)),
            last_window_day: None,
        }
    }

    /// One dispatch tick. `now` is injected so scenarios can drive the
    /// scheduler through synthetic time.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        // Trigger pokes force a full pass (windows included) this tick.
        let pokes = self.broker.claim(names::SCHEDULER_TICK, 16, now).await?;
        for poke in &pokes {
            self.broker.ack(poke.message_id).await?;
        }
        report.triggered = !pokes.is_empty();

        let today = now.date_naive();
        if report.triggered || self.last_window_day != Some(today) {
            self.advance_windows(now).await?;
            if self.last_window_day != Some(today) {
                self.housekeeping(now).await?;
            }
            self.last_window_day = Some(today);
            report.windows_advanced = true;
        }

        report.dispatched = self.dispatch_due(now).await?;
        Ok(report)
    }

    /// Publish one `transcript_check` per claimable due row.
    ///
    /// The claim lease stays in place after publish: the fetcher's completion
    /// update reopens the row, and a lost message reopens it at lease expiry.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = schedule::claim_due(&self.pool, self.dispatch_batch, now, self.lease)
            .await
            .context("schedule claim failed")?;

        for row in &rows {
            let payload = TranscriptCheck {
                row_id: row.row_id,
                equity_id: row.equity_id,
                quarter: row.quarter,
                year: row.year,
            };
            self.broker
                .publish(names::TRANSCRIPT_CHECK, &payload, Duration::zero(), now)
                .await?;
            debug!(
                row_id = row.row_id,
                equity_id = row.equity_id,
                quarter = row.quarter,
                year = row.year,
                priority = row.priority,
                "dispatched transcript check"
            );
        }
        Ok(rows.len())
    }

    /// Ensure every tracked equity has a schedule row for the current fiscal
    /// target, watchlist items on the fast lane. Rows for equities that left
    /// all tracked sets are deleted.
    pub async fn advance_windows(&self, now: DateTime<Utc>) -> Result<()> {
        let target = calendar::target_for(now.date_naive());
        let tracked = tdk_db::universe::list_tracked_equities(&self.pool).await?;

        for eq in &tracked {
            let priority = if eq.on_watchlist {
                PRIORITY_WATCHLIST
            } else {
                PRIORITY_GROUP
            };
            schedule::ensure_row(
                &self.pool,
                eq.equity_id,
                target.quarter,
                target.year,
                priority,
                now,
            )
            .await?;
        }

        let removed = schedule::delete_untracked(&self.pool).await?;
        if removed > 0 {
            info!(removed, "dropped schedule rows for untracked equities");
        }
        Ok(())
    }

    /// Daily housekeeping: soft-retire rows long past their transcript, prune
    /// aged dead letters and terminal outbox rows.
    async fn housekeeping(&self, now: DateTime<Utc>) -> Result<()> {
        let retired = schedule::retire_stale(
            &self.pool,
            now - cadence::retirement_window(),
            now + cadence::retired_delta(),
        )
        .await?;
        if retired > 0 {
            info!(retired, "soft-retired schedule rows");
        }

        let cutoff = now - Duration::days(90);
        let dead = tdk_db::queue::prune_dead_letters(&self.pool, cutoff).await?;
        let outbox = tdk_db::outbox::prune_terminal_outbox(&self.pool, cutoff).await?;
        if dead + outbox > 0 {
            info!(dead, outbox, "pruned aged terminal records");
        }
        Ok(())
    }

    /// Free-running loop for the daemon. Stops claiming as soon as the token
    /// cancels; anything mid-flight completes its current tick.
    pub async fn run_loop(mut self, cancel: CancellationToken, status: SharedSchedulerStatus) {
        {
            let mut s = status.write().await;
            s.scheduler_running = true;
            s.poll_interval_seconds = self.tick_interval.as_secs();
        }
        info!(interval_secs = self.tick_interval.as_secs(), "scheduler started");

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Utc::now();
            {
                let mut s = status.write().await;
                s.is_polling = true;
            }

            if let Err(e) = self.tick(now).await {
                warn!(error = %format!("{e:#}"), "scheduler tick failed");
            }

            let next = schedule::next_due_at(&self.pool).await.unwrap_or(None);
            {
                let mut s = status.write().await;
                s.is_polling = false;
                s.last_tick_at = Some(now);
                s.next_poll_at = next;
            }
        }

        let mut s = status.write().await;
        s.scheduler_running = false;
        s.is_polling = false;
        info!("scheduler stopped");
    }
}

/// Draw the unit jitter sample for cadence computation.
pub fn draw_jitter() -> f64 {
    rand::thread_rng().gen_range(0.0..1.0)
}
