//! Group research coordinator.
//!
//! Two-stage flow on one queue: member-ready signals evaluate fan-in and open
//! the run exactly once per `(group, quarter, year)`; dispatch messages
//! execute it. A periodic sweep re-evaluates every active group against the
//! current fiscal target so a lost signal cannot wedge a group. A `done` run
//! is frozen; only the force path re-opens it.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tdk_db::{research, universe};
use tdk_llm::{GenerateRequest, LanguageModel};
use tdk_queue::{names, Delivery, NackOutcome, QueueBroker};
use tdk_scheduler::calendar;
use tdk_schemas::GroupResearchRequest;

/// Retry backoff for transient research failures:
/// `min(2^attempts · 30 s, 30 min)`.
fn research_backoff(attempts: i64) -> Duration {
    let exp = attempts.clamp(0, 12) as u32;
    let secs = 30i64.saturating_mul(1i64 << exp);
    Duration::seconds(secs.min(1800))
}

pub struct ResearchCoordinator {
    pool: SqlitePool,
    broker: QueueBroker,
    model: Arc<dyn LanguageModel>,
    sweep_interval: std::time::Duration,
}

impl ResearchCoordinator {
    pub fn new(
        pool: SqlitePool,
        broker: QueueBroker,
        model: Arc<dyn LanguageModel>,
        sweep_interval_secs: u64,
    ) -> Self {
        ResearchCoordinator {
            pool,
            broker,
            model,
            sweep_interval: std::time::Duration::from_secs(sweep_interval_secs.max(1)),
        }
    }

    /// Handle one claimed `group_research_request`.
    pub async fn process_delivery(&self, delivery: &Delivery, now: DateTime<Utc>) -> Result<()> {
        let request: GroupResearchRequest = match delivery.decode() {
            Ok(r) => r,
            Err(e) => {
                self.broker
                    .dead_letter(delivery, &format!("{e:#}"), now)
                    .await?;
                return Ok(());
            }
        };

        match request {
            GroupResearchRequest::MemberReady {
                equity_id,
                quarter,
                year,
            } => {
                for group in universe::active_groups_for_equity(&self.pool, equity_id).await? {
                    self.try_open_run(group.group_id, quarter, year, now).await?;
                }
                self.broker.ack(delivery.message_id).await?;
            }
            GroupResearchRequest::Dispatch {
                group_id,
                quarter,
                year,
                force,
            } => match self.run_research(group_id, quarter, year, force, now).await {
                Ok(()) => {
                    self.broker.ack(delivery.message_id).await?;
                }
                Err(RunFailure::Transient(msg)) => {
                    let backoff = research_backoff(delivery.attempts);
                    let outcome = self.broker.nack(delivery, backoff, &msg, now).await?;
                    if outcome == NackOutcome::DeadLettered {
                        if let Some(run) =
                            research::fetch_run(&self.pool, group_id, quarter, year).await?
                        {
                            research::run_fail(
                                &self.pool,
                                run.run_id,
                                &format!("attempts exhausted: {msg}"),
                                now,
                            )
                            .await?;
                        }
                    }
                    warn!(group_id, quarter, year, error = %msg, "research transient failure");
                }
                Err(RunFailure::Permanent(msg)) => {
                    if let Some(run) =
                        research::fetch_run(&self.pool, group_id, quarter, year).await?
                    {
                        research::run_fail(&self.pool, run.run_id, &msg, now).await?;
                    }
                    self.broker.ack(delivery.message_id).await?;
                    warn!(group_id, quarter, year, error = %msg, "research permanent failure");
                }
            },
        }
        Ok(())
    }

    /// Stage 1: open the run when fan-in is satisfied and no run exists yet.
    /// Returns `true` when this call created the run.
    pub async fn try_open_run(
        &self,
        group_id: i64,
        quarter: i64,
        year: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if research::fetch_run(&self.pool, group_id, quarter, year)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        if !research::fan_in_ready(&self.pool, group_id, quarter, year).await? {
            return Ok(false);
        }

        let Some(_run_id) =
            research::insert_run_deduped(&self.pool, group_id, quarter, year, now).await?
        else {
            return Ok(false);
        };

        self.broker
            .publish(
                names::GROUP_RESEARCH_REQUEST,
                &GroupResearchRequest::Dispatch {
                    group_id,
                    quarter,
                    year,
                    force: false,
                },
                Duration::zero(),
                now,
            )
            .await?;
        info!(group_id, quarter, year, "group research run opened");
        Ok(true)
    }

    /// Force path (admin surface): create or re-open the run and dispatch it
    /// immediately, skipping the fan-in check. Missing members are simply
    /// absent from the digest.
    pub async fn force_run(
        &self,
        group_id: i64,
        quarter: i64,
        year: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let run_id = research::reopen_run(&self.pool, group_id, quarter, year, now).await?;
        self.broker
            .publish(
                names::GROUP_RESEARCH_REQUEST,
                &GroupResearchRequest::Dispatch {
                    group_id,
                    quarter,
                    year,
                    force: true,
                },
                Duration::zero(),
                now,
            )
            .await?;
        info!(group_id, quarter, year, run_id, "group research run forced");
        Ok(run_id)
    }

    /// Reconciliation sweep: re-evaluate every active group against the
    /// current fiscal target.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let target = calendar::target_for(now.date_naive());
        let mut opened = 0;
        for group in universe::list_active_groups(&self.pool).await? {
            if self
                .try_open_run(group.group_id, target.quarter, target.year, now)
                .await?
            {
                opened += 1;
            }
        }
        Ok(opened)
    }

    /// Stage 2: execute the article run.
    async fn run_research(
        &self,
        group_id: i64,
        quarter: i64,
        year: i64,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<(), RunFailure> {
        let group = universe::fetch_group(&self.pool, group_id)
            .await
            .map_err(transient)?
            .ok_or_else(|| RunFailure::Permanent(format!("group {group_id} does not exist")))?;

        // CAS pending → in_progress; a run that is already done (or being
        // worked elsewhere) is frozen unless forced.
        let Some(run) = research::run_begin(&self.pool, group_id, quarter, year, force, now)
            .await
            .map_err(transient)?
        else {
            return Ok(());
        };

        let prompt = group
            .deep_research_prompt
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                RunFailure::Permanent(format!("group {} has no research prompt", group.name))
            })?;

        let digest = research::member_digest(&self.pool, group_id, quarter, year)
            .await
            .map_err(transient)?;
        if digest.is_empty() {
            return Err(RunFailure::Permanent(
                "no member analyses available for this quarter".to_string(),
            ));
        }

        let mut input = String::new();
        for member in &digest {
            input.push_str(&format!(
                "## {} — {} (Q{} {})\n\n{}\n\n",
                member.symbol, member.name, member.quarter, member.year, member.output_text
            ));
        }

        let generation = self
            .model
            .generate(&GenerateRequest {
                prompt: prompt.clone(),
                input_text: input,
            })
            .await;

        match generation {
            Ok(g) => {
                let model_ref = self.model.model_ref();
                research::run_complete(
                    &self.pool,
                    run.run_id,
                    &prompt,
                    &g.output_text,
                    model_ref.provider.as_str(),
                    &model_ref.model_id,
                    model_ref.revision.as_deref(),
                    now,
                )
                .await
                .map_err(transient)?;
                info!(group_id, quarter, year, run_id = run.run_id, "group research done");
                Ok(())
            }
            Err(e) if e.is_transient() => {
                research::run_revert_pending(&self.pool, run.run_id, now)
                    .await
                    .map_err(transient)?;
                Err(RunFailure::Transient(e.to_string()))
            }
            Err(e) => Err(RunFailure::Permanent(e.to_string())),
        }
    }

    /// Free-running coordinator task: consumes the queue and runs the sweep
    /// on its interval.
    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!("research coordinator started");
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        warn!(error = %format!("{e:#}"), "research sweep failed");
                    }
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
            }

            let now = Utc::now();
            let batch = match self.broker.claim(names::GROUP_RESEARCH_REQUEST, 4, now).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "claim failed");
                    continue;
                }
            };
            for delivery in &batch {
                if let Err(e) = self.process_delivery(delivery, Utc::now()).await {
                    warn!(
                        message_id = delivery.message_id,
                        error = %format!("{e:#}"),
                        "research request failed; message returns at lease expiry"
                    );
                }
            }
        }
        info!("research coordinator stopped");
    }
}

enum RunFailure {
    Transient(String),
    Permanent(String),
}

fn transient(e: anyhow::Error) -> RunFailure {
    RunFailure::Transient(format!("{e:#}"))
}
