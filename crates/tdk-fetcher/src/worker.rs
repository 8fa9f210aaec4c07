//! Fetch worker: consumes `transcript_check`, polls the oracle, records
//! observations, and hands newly available transcripts to the analysis lane.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tdk_db::schedule::{self, ScheduleRow};
use tdk_db::universe::EquityRow;
use tdk_db::{jobs, transcripts, universe};
use tdk_queue::{names, Delivery, QueueBroker};
use tdk_scheduler::cadence::{self, PollSignal};
use tdk_scheduler::calendar;
use tdk_schemas::{AnalysisRequest, TranscriptCheck};

use crate::provider::{OracleObservation, OracleQuery, TranscriptOracle};
use crate::ratelimit::TokenBucket;

pub struct Fetcher {
    pool: SqlitePool,
    broker: QueueBroker,
    oracle: Arc<dyn TranscriptOracle>,
    bucket: Arc<TokenBucket>,
}

impl Fetcher {
    pub fn new(
        pool: SqlitePool,
        broker: QueueBroker,
        oracle: Arc<dyn TranscriptOracle>,
        bucket: Arc<TokenBucket>,
    ) -> Self {
        Fetcher {
            pool,
            broker,
            oracle,
            bucket,
        }
    }

    /// Handle one claimed `transcript_check`. Every exit path settles the
    /// message (ack, nack, or dead-letter); `Err` is reserved for store
    /// failures, which leave the message to its lease.
    pub async fn process_delivery(&self, delivery: &Delivery, now: DateTime<Utc>) -> Result<()> {
        let check: TranscriptCheck = match delivery.decode() {
            Ok(c) => c,
            Err(e) => {
                self.broker
                    .dead_letter(delivery, &format!("{e:#}"), now)
                    .await?;
                return Ok(());
            }
        };

        // Stale messages (row retired or re-targeted since dispatch) are done.
        let Some(row) = schedule::fetch_row(&self.pool, check.row_id).await? else {
            self.broker.ack(delivery.message_id).await?;
            return Ok(());
        };
        if row.equity_id != check.equity_id
            || row.quarter != check.quarter
            || row.year != check.year
        {
            self.broker.ack(delivery.message_id).await?;
            return Ok(());
        }
        let Some(equity) = universe::fetch_equity(&self.pool, row.equity_id).await? else {
            self.broker.ack(delivery.message_id).await?;
            return Ok(());
        };

        self.bucket.acquire().await;
        let query = OracleQuery {
            identifier: equity.identifier.clone(),
            symbol: equity.symbol.clone(),
            quarter: row.quarter,
            year: row.year,
        };

        match self.oracle.check(&query).await {
            Ok(obs) => {
                self.bucket.on_success().await;
                self.apply_observation(&row, &equity, obs, now).await?;
                self.broker.ack(delivery.message_id).await?;
            }
            Err(e) if e.is_rate_limited() => {
                // Retreat and retry the message; the schedule row keeps its
                // lease and never records an error for backpressure.
                self.bucket.on_rate_limited().await;
                let backoff = cadence::transient_backoff(delivery.attempts);
                self.broker
                    .nack(delivery, backoff, &e.to_string(), now)
                    .await?;
            }
            Err(e) if e.is_transient() => {
                let new_attempts = row.attempts + 1;
                let next = now + cadence::transient_backoff(new_attempts);
                schedule::bump_transient_error(&self.pool, row.row_id, next, now).await?;
                warn!(
                    equity = %equity.symbol,
                    attempts = new_attempts,
                    error = %e,
                    "oracle transient error; backing off"
                );
                // The message did its job: the row owns the retry cadence.
                self.broker.ack(delivery.message_id).await?;
            }
            Err(e) => {
                schedule::mark_permanent_error(
                    &self.pool,
                    row.row_id,
                    now + cadence::permanent_error_delta(),
                    now,
                )
                .await?;
                warn!(equity = %equity.symbol, error = %e, "oracle permanent error");
                self.broker.ack(delivery.message_id).await?;
            }
        }
        Ok(())
    }

    async fn apply_observation(
        &self,
        row: &ScheduleRow,
        equity: &EquityRow,
        obs: OracleObservation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match obs {
            OracleObservation::Available {
                source_url,
                event_date,
            } => {
                let transcript = transcripts::upsert_available(
                    &self.pool,
                    row.equity_id,
                    row.quarter,
                    row.year,
                    &source_url,
                    event_date,
                    now,
                )
                .await?;

                let first_observation = transcripts::record_event(
                    &self.pool,
                    row.equity_id,
                    row.quarter,
                    row.year,
                    transcripts::TranscriptStatus::Available,
                    Some(&source_url),
                    event_date,
                    "poll",
                    now,
                )
                .await?;

                if first_observation && self.eligible_for_analysis(row, now).await? {
                    self.enqueue_analysis(transcript.transcript_id, &source_url, now)
                        .await?;
                }

                let next = now + cadence::next_delta(PollSignal::Available, tdk_scheduler::draw_jitter());
                schedule::complete_check(&self.pool, row.row_id, "available", next, true, now)
                    .await?;
                info!(
                    equity = %equity.symbol,
                    quarter = row.quarter,
                    year = row.year,
                    first_observation,
                    "transcript available"
                );
            }
            OracleObservation::Upcoming { event_date } => {
                transcripts::upsert_upcoming(
                    &self.pool,
                    row.equity_id,
                    row.quarter,
                    row.year,
                    event_date,
                    now,
                )
                .await?;
                transcripts::record_event(
                    &self.pool,
                    row.equity_id,
                    row.quarter,
                    row.year,
                    transcripts::TranscriptStatus::Upcoming,
                    None,
                    event_date,
                    "poll",
                    now,
                )
                .await?;

                let signal = match event_date {
                    Some(d) => PollSignal::Upcoming { event_in: d - now },
                    None => PollSignal::UpcomingNoDate,
                };
                let next = now + cadence::next_delta(signal, tdk_scheduler::draw_jitter());
                schedule::complete_check(&self.pool, row.row_id, "upcoming", next, false, now)
                    .await?;
                debug!(equity = %equity.symbol, ?event_date, "transcript upcoming");
            }
            OracleObservation::None => {
                transcripts::record_event(
                    &self.pool,
                    row.equity_id,
                    row.quarter,
                    row.year,
                    transcripts::TranscriptStatus::None,
                    None,
                    None,
                    "poll",
                    now,
                )
                .await?;

                let signal = if calendar::is_active_quarter(row.quarter, row.year, now.date_naive())
                {
                    PollSignal::NoneActiveQuarter
                } else {
                    PollSignal::NoneOffQuarter
                };
                let next = now + cadence::next_delta(signal, tdk_scheduler::draw_jitter());
                schedule::complete_check(&self.pool, row.row_id, "none", next, false, now).await?;
            }
        }
        Ok(())
    }

    /// Analysis eligibility: watchlist equities always, group-only equities
    /// only while the polled quarter is still the active fiscal target.
    async fn eligible_for_analysis(&self, row: &ScheduleRow, now: DateTime<Utc>) -> Result<bool> {
        if universe::is_on_watchlist(&self.pool, row.equity_id).await? {
            return Ok(true);
        }
        if !calendar::is_active_quarter(row.quarter, row.year, now.date_naive()) {
            return Ok(false);
        }
        Ok(!universe::active_groups_for_equity(&self.pool, row.equity_id)
            .await?
            .is_empty())
    }

    /// Create the job and publish the request. The job insert is the
    /// idempotency gate; a key that already exists publishes nothing.
    async fn enqueue_analysis(
        &self,
        transcript_id: i64,
        source_url: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = jobs::idempotency_key(transcript_id, source_url, 0);
        if jobs::insert_job_deduped(&self.pool, transcript_id, &key, false, now)
            .await?
            .is_some()
        {
            self.broker
                .publish(
                    names::ANALYSIS_REQUEST,
                    &AnalysisRequest {
                        transcript_id,
                        source_url: source_url.to_string(),
                        force: false,
                        idempotency_key: key,
                    },
                    chrono::Duration::zero(),
                    now,
                )
                .await?;
            info!(transcript_id, "analysis request enqueued");
        }
        Ok(())
    }

    /// Free-running pool worker. Claims in small batches; an idle lane sleeps
    /// briefly instead of spinning.
    pub async fn run_loop(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        info!(worker_id, "fetch worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let now = Utc::now();
            let batch = match self.broker.claim(names::TRANSCRIPT_CHECK, 4, now).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(worker_id, error = %format!("{e:#}"), "claim failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                }
                continue;
            }

            for delivery in &batch {
                if let Err(e) = self.process_delivery(delivery, Utc::now()).await {
                    warn!(
                        worker_id,
                        message_id = delivery.message_id,
                        error = %format!("{e:#}"),
                        "transcript check failed; message returns at lease expiry"
                    );
                }
            }
        }
        info!(worker_id, "fetch worker stopped");
    }
}
