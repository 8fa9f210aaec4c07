//! Analysis worker: consumes `analysis_request`, holds the per-transcript
//! reservation, produces the stored analysis, and fans out notifications and
//! the group member-ready signal.
//!
//! The long-running external calls (download, model) happen outside any
//! store transaction; only the final commit is transactional.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tdk_db::{analyses, jobs, outbox, transcripts, universe, JobStatus, NewAnalysis};
use tdk_llm::{GenerateRequest, LanguageModel};
use tdk_queue::{names, Delivery, NackOutcome, QueueBroker};
use tdk_schemas::{AnalysisRequest, GroupResearchRequest};

use crate::content_store::ContentStore;
use crate::extract;
use crate::prompt;

/// Retry backoff for transient analysis failures:
/// `min(2^attempts · 30 s, 30 min)`.
pub fn analysis_backoff(attempts: i64) -> Duration {
    let exp = attempts.clamp(0, 12) as u32;
    let secs = 30i64.saturating_mul(1i64 << exp);
    Duration::seconds(secs.min(1800))
}

enum WorkFailure {
    Transient(String),
    Permanent(String),
}

pub struct AnalysisWorker {
    pool: SqlitePool,
    broker: QueueBroker,
    model: Arc<dyn LanguageModel>,
    content: ContentStore,
    http: reqwest::Client,
    default_prompt: String,
    job_lease: Duration,
}

impl AnalysisWorker {
    pub fn new(
        pool: SqlitePool,
        broker: QueueBroker,
        model: Arc<dyn LanguageModel>,
        content: ContentStore,
        download_timeout: std::time::Duration,
        default_prompt: String,
        job_lease_secs: i64,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(download_timeout)
            .build()
            .expect("reqwest client build must not fail");
        AnalysisWorker {
            pool,
            broker,
            model,
            content,
            http,
            default_prompt,
            job_lease: Duration::seconds(job_lease_secs),
        }
    }

    /// Handle one claimed `analysis_request`.
    pub async fn process_delivery(&self, delivery: &Delivery, now: DateTime<Utc>) -> Result<()> {
        let request: AnalysisRequest = match delivery.decode() {
            Ok(r) => r,
            Err(e) => {
                self.broker
                    .dead_letter(delivery, &format!("{e:#}"), now)
                    .await?;
                return Ok(());
            }
        };

        // The job row is the durable unit of work; a message without one is
        // stale (its producer rolled back or the job was pruned).
        let Some(job) = jobs::fetch_job_by_key(&self.pool, &request.idempotency_key).await? else {
            self.broker.ack(delivery.message_id).await?;
            return Ok(());
        };

        match JobStatus::parse(&job.status)? {
            JobStatus::Done => {
                // Crash-recovery replay: the analysis is committed but the
                // fan-out may not have finished. Re-run it; every step
                // dedupes.
                if let Some(analysis) =
                    analyses::latest_for_transcript(&self.pool, request.transcript_id).await?
                {
                    self.fan_out(&analysis, now).await?;
                }
                self.broker.ack(delivery.message_id).await?;
                return Ok(());
            }
            JobStatus::Dead | JobStatus::Error => {
                self.broker.ack(delivery.message_id).await?;
                return Ok(());
            }
            JobStatus::Pending | JobStatus::InProgress => {}
        }

        // Per-transcript single flight. A failed reserve usually means a live
        // worker holds the transcript — but if the holder is a previous
        // attempt of THIS unit whose job lease has expired, the holder is
        // dead and the reservation is ours to reclaim.
        if !transcripts::try_reserve_analysis(&self.pool, request.transcript_id).await? {
            let dead_holder = job.status == JobStatus::InProgress.as_str()
                && job.locked_until_utc.map_or(true, |t| t < now);
            if !dead_holder {
                if request.force {
                    // Bounded wait-to-reserve: come back shortly.
                    self.broker
                        .nack(delivery, Duration::seconds(30), "reservation held", now)
                        .await?;
                } else {
                    self.broker.ack(delivery.message_id).await?;
                }
                return Ok(());
            }
        }

        if jobs::job_begin_attempt(&self.pool, &request.idempotency_key, now, self.job_lease)
            .await?
            .is_none()
        {
            // Job reached a terminal state between fetch and begin.
            transcripts::release_analysis_reservation(&self.pool, request.transcript_id).await?;
            self.broker.ack(delivery.message_id).await?;
            return Ok(());
        }

        match self.run_analysis(&request, now).await {
            Ok(analysis) => {
                jobs::job_mark_done(&self.pool, &request.idempotency_key).await?;
                self.fan_out(&analysis, now).await?;
                self.broker.ack(delivery.message_id).await?;
                info!(
                    transcript_id = request.transcript_id,
                    analysis_id = analysis.analysis_id,
                    tokens_in = analysis.tokens_in,
                    tokens_out = analysis.tokens_out,
                    "analysis committed"
                );
            }
            Err(WorkFailure::Transient(msg)) => {
                transcripts::release_analysis_reservation(&self.pool, request.transcript_id)
                    .await?;
                let backoff = analysis_backoff(delivery.attempts);
                let outcome = self.broker.nack(delivery, backoff, &msg, now).await?;
                match outcome {
                    NackOutcome::Requeued(retry_at) => {
                        jobs::job_mark_retrying(&self.pool, &request.idempotency_key, retry_at, &msg)
                            .await?;
                        warn!(
                            transcript_id = request.transcript_id,
                            attempts = delivery.attempts,
                            error = %msg,
                            "analysis transient failure; retrying"
                        );
                    }
                    NackOutcome::DeadLettered => {
                        jobs::job_mark_failed(
                            &self.pool,
                            &request.idempotency_key,
                            JobStatus::Dead,
                            &msg,
                        )
                        .await?;
                        transcripts::mark_analysis_error(
                            &self.pool,
                            request.transcript_id,
                            &format!("attempts exhausted: {msg}"),
                            now,
                        )
                        .await?;
                        warn!(
                            transcript_id = request.transcript_id,
                            error = %msg,
                            "analysis dead-lettered"
                        );
                    }
                }
            }
            Err(WorkFailure::Permanent(msg)) => {
                jobs::job_mark_failed(&self.pool, &request.idempotency_key, JobStatus::Error, &msg)
                    .await?;
                transcripts::mark_analysis_error(&self.pool, request.transcript_id, &msg, now)
                    .await?;
                self.broker.ack(delivery.message_id).await?;
                warn!(
                    transcript_id = request.transcript_id,
                    error = %msg,
                    "analysis permanent failure"
                );
            }
        }
        Ok(())
    }

    /// The fallible middle: fetch text, resolve prompt, call the model,
    /// commit. Store failures are transient by definition.
    async fn run_analysis(
        &self,
        request: &AnalysisRequest,
        now: DateTime<Utc>,
    ) -> Result<tdk_db::AnalysisRow, WorkFailure> {
        let transcript = transcripts::fetch_transcript(&self.pool, request.transcript_id)
            .await
            .map_err(transient)?
            .ok_or_else(|| {
                WorkFailure::Permanent(format!(
                    "transcript {} does not exist",
                    request.transcript_id
                ))
            })?;

        let text = self.fetch_text(&transcript, &request.source_url).await?;

        let prompt =
            prompt::resolve_stock_prompt(&self.pool, transcript.equity_id, &self.default_prompt)
                .await
                .map_err(transient)?;

        let generation = self
            .model
            .generate(&GenerateRequest {
                prompt: prompt.clone(),
                input_text: text,
            })
            .await
            .map_err(|e| {
                if e.is_transient() {
                    WorkFailure::Transient(e.to_string())
                } else {
                    WorkFailure::Permanent(e.to_string())
                }
            })?;

        let model_ref = self.model.model_ref();
        let new = NewAnalysis {
            transcript_id: transcript.transcript_id,
            idempotency_key: request.idempotency_key.clone(),
            prompt_snapshot: prompt,
            output_text: generation.output_text,
            model_provider: model_ref.provider.as_str().to_string(),
            model_id: model_ref.model_id.clone(),
            model_revision: model_ref.revision.clone(),
            tokens_in: generation.tokens_in,
            tokens_out: generation.tokens_out,
            cost_microusd: generation.cost_microusd,
        };

        let analysis_id = analyses::complete_analysis(&self.pool, &new, now)
            .await
            .map_err(transient)?;
        analyses::fetch_analysis(&self.pool, analysis_id)
            .await
            .map_err(transient)?
            .ok_or_else(|| WorkFailure::Transient("committed analysis vanished".to_string()))
    }

    /// Prefer the cached extraction; otherwise download, extract, and cache.
    async fn fetch_text(
        &self,
        transcript: &tdk_db::TranscriptRow,
        source_url: &str,
    ) -> Result<String, WorkFailure> {
        if let Some(path) = &transcript.content_path {
            if let Some(text) = self
                .content
                .load(std::path::Path::new(path))
                .await
                .map_err(transient)?
            {
                return Ok(text);
            }
        }

        let resp = self
            .http
            .get(source_url)
            .send()
            .await
            .map_err(|e| WorkFailure::Transient(format!("transcript download failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let msg = format!("transcript download http status {status}");
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(WorkFailure::Transient(msg));
            }
            return Err(WorkFailure::Permanent(msg));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| WorkFailure::Transient(format!("transcript body read failed: {e}")))?;
        let text = extract::extract_text(&bytes)
            .map_err(|e| WorkFailure::Permanent(e.to_string()))?;

        let path = self
            .content
            .store(transcript.transcript_id, source_url, &text)
            .await
            .map_err(transient)?;
        transcripts::set_content_path(
            &self.pool,
            transcript.transcript_id,
            &path.to_string_lossy(),
        )
        .await
        .map_err(transient)?;

        Ok(text)
    }

    /// Post-commit effects. Every step is idempotent, so the crash-recovery
    /// replay can run this again safely.
    async fn fan_out(&self, analysis: &tdk_db::AnalysisRow, now: DateTime<Utc>) -> Result<()> {
        let Some(transcript) =
            transcripts::fetch_transcript(&self.pool, analysis.transcript_id).await?
        else {
            return Ok(());
        };

        // Notification emails go out for watchlist equities only.
        if universe::is_on_watchlist(&self.pool, transcript.equity_id).await? {
            for recipient in universe::list_active_recipients(&self.pool).await? {
                outbox::outbox_insert_deduped(
                    &self.pool,
                    analysis.analysis_id,
                    &recipient.email,
                    now,
                )
                .await?;
            }
        }

        // Group members signal the coordinator on every completion.
        if !universe::active_groups_for_equity(&self.pool, transcript.equity_id)
            .await?
            .is_empty()
        {
            self.broker
                .publish(
                    names::GROUP_RESEARCH_REQUEST,
                    &GroupResearchRequest::MemberReady {
                        equity_id: transcript.equity_id,
                        quarter: transcript.quarter,
                        year: transcript.year,
                    },
                    Duration::zero(),
                    now,
                )
                .await?;
        }
        Ok(())
    }

    /// Free-running pool worker. One message at a time: global analysis
    /// parallelism is the worker count, independent of queue width.
    pub async fn run_loop(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        info!(worker_id, "analysis worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let now = Utc::now();
            let batch = match self.broker.claim(names::ANALYSIS_REQUEST, 1, now).await {
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
                        "analysis request failed; message returns at lease expiry"
                    );
                }
            }
        }
        info!(worker_id, "analysis worker stopped");
    }
}

fn transient(e: anyhow::Error) -> WorkFailure {
    WorkFailure::Transient(format!("{e:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_clamps_at_thirty_minutes() {
        assert_eq!(analysis_backoff(1), Duration::seconds(60));
        assert_eq!(analysis_backoff(2), Duration::seconds(120));
        assert_eq!(analysis_backoff(5), Duration::seconds(960));
        assert_eq!(analysis_backoff(6), Duration::seconds(1800));
        assert_eq!(analysis_backoff(11), Duration::seconds(1800));
    }
}
