//! Outbox drain worker.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tdk_db::{analyses, outbox, transcripts, universe, OutboxRow, OutboxStatus};

use crate::mailer::{Mailer, SendOutcome};
use crate::render;

/// Retry backoff for transient send failures:
/// `min(2^attempts · 60 s, 6 h)`.
pub fn email_backoff(attempts: i64) -> Duration {
    let exp = attempts.clamp(0, 12) as u32;
    let secs = 60i64.saturating_mul(1i64 << exp);
    Duration::seconds(secs.min(6 * 3600))
}

pub struct EmailWorker {
    pool: SqlitePool,
    mailer: Arc<dyn Mailer>,
    batch: i64,
    lease: Duration,
    max_attempts: i64,
}

impl EmailWorker {
    pub fn new(
        pool: SqlitePool,
        mailer: Arc<dyn Mailer>,
        batch: i64,
        lease_secs: i64,
        max_attempts: i64,
    ) -> Self {
        EmailWorker {
            pool,
            mailer,
            batch,
            lease: Duration::seconds(lease_secs),
            max_attempts,
        }
    }

    /// Claim and process one batch. Returns how many rows were handled.
    pub async fn drain_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = outbox::outbox_claim_due(&self.pool, self.batch, now, self.lease).await?;
        for row in &rows {
            self.process_row(row, now).await?;
        }
        Ok(rows.len())
    }

    async fn process_row(&self, row: &OutboxRow, now: DateTime<Utc>) -> Result<()> {
        // Resolve the rendering inputs from durable state only.
        let Some(analysis) = analyses::fetch_analysis(&self.pool, row.analysis_id).await? else {
            outbox::outbox_mark_terminal(
                &self.pool,
                row.outbox_id,
                OutboxStatus::Failed,
                "owning analysis no longer exists",
            )
            .await?;
            return Ok(());
        };
        let transcript = transcripts::fetch_transcript(&self.pool, analysis.transcript_id).await?;
        let equity = match &transcript {
            Some(t) => universe::fetch_equity(&self.pool, t.equity_id).await?,
            None => None,
        };
        let (Some(transcript), Some(equity)) = (transcript, equity) else {
            outbox::outbox_mark_terminal(
                &self.pool,
                row.outbox_id,
                OutboxStatus::Failed,
                "owning transcript or equity no longer exists",
            )
            .await?;
            return Ok(());
        };

        let (subject, body) = render::render_analysis_email(
            &equity.symbol,
            &equity.name,
            transcript.quarter,
            transcript.year,
            &analysis.output_text,
        );

        match self.mailer.send(&row.recipient, &subject, &body).await {
            SendOutcome::Sent => {
                outbox::outbox_mark_sent(&self.pool, row.outbox_id, now).await?;
                info!(outbox_id = row.outbox_id, recipient = %row.recipient, "email sent");
            }
            SendOutcome::Transient(msg) => {
                let next_attempts = row.attempts + 1;
                if next_attempts >= self.max_attempts {
                    outbox::outbox_mark_terminal(
                        &self.pool,
                        row.outbox_id,
                        OutboxStatus::Dead,
                        &format!("attempts exhausted: {msg}"),
                    )
                    .await?;
                    warn!(outbox_id = row.outbox_id, error = %msg, "email dead-lettered");
                } else {
                    let retry_at = now + email_backoff(next_attempts);
                    outbox::outbox_mark_retry(&self.pool, row.outbox_id, retry_at, &msg).await?;
                    warn!(
                        outbox_id = row.outbox_id,
                        attempts = next_attempts,
                        error = %msg,
                        "email transient failure; retrying"
                    );
                }
            }
            SendOutcome::Permanent(msg) => {
                outbox::outbox_mark_terminal(&self.pool, row.outbox_id, OutboxStatus::Failed, &msg)
                    .await?;
                warn!(outbox_id = row.outbox_id, error = %msg, "email permanently failed");
            }
        }
        Ok(())
    }

    /// Free-running pool worker.
    pub async fn run_loop(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        info!(worker_id, "email worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.drain_once(Utc::now()).await {
                Ok(0) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(worker_id, error = %format!("{e:#}"), "outbox drain failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
        info!(worker_id, "email worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_clamps_at_six_hours() {
        assert_eq!(email_backoff(1), Duration::seconds(120));
        assert_eq!(email_backoff(2), Duration::seconds(240));
        assert_eq!(email_backoff(8), Duration::seconds(6 * 3600));
        assert_eq!(email_backoff(12), Duration::seconds(6 * 3600));
    }
}
