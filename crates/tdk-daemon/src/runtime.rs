//! Worker-pool wiring and graceful shutdown.
//!
//! One scheduler task, `N_f` fetchers, `N_a` analysis workers, `N_e` email
//! workers, one research coordinator. No shared mutable state between pools:
//! everything coordinates through the store and the broker, so any pool can
//! later move to a sidecar process without API change.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tdk_analysis::{AnalysisWorker, ContentStore};
use tdk_config::{PipelineConfig, ResolvedSecrets};
use tdk_email::{EmailWorker, SmtpMailer};
use tdk_fetcher::{Fetcher, HttpTranscriptOracle, TokenBucket};
use tdk_llm::{build_model, ModelRef, ModelSettings, Pricing, ProviderKind};
use tdk_queue::{names, QueueBroker, QueuePolicy};
use tdk_research::ResearchCoordinator;
use tdk_scheduler::{Scheduler, SharedSchedulerStatus};

/// Running worker pools plus the cancellation token that stops them.
pub struct Pipeline {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    pub research: Arc<ResearchCoordinator>,
}

/// Broker with the per-lane delivery policies from config.
pub fn build_broker(pool: SqlitePool, cfg: &PipelineConfig) -> QueueBroker {
    QueueBroker::new(pool)
        .with_policy(
            names::TRANSCRIPT_CHECK,
            QueuePolicy {
                lease: chrono::Duration::seconds(cfg.fetcher.queue_lease_secs),
                max_attempts: cfg.fetcher.max_attempts,
            },
        )
        .with_policy(
            names::ANALYSIS_REQUEST,
            QueuePolicy {
                lease: chrono::Duration::seconds(cfg.analysis.queue_lease_secs),
                max_attempts: cfg.analysis.max_attempts,
            },
        )
        .with_policy(
            names::GROUP_RESEARCH_REQUEST,
            QueuePolicy {
                lease: chrono::Duration::seconds(cfg.research.queue_lease_secs),
                max_attempts: cfg.research.max_attempts,
            },
        )
}

pub fn build_model_from_config(
    cfg: &PipelineConfig,
    secrets: &ResolvedSecrets,
) -> Result<Arc<dyn tdk_llm::LanguageModel>> {
    let model_cfg = &cfg.analysis.model;
    let provider = ProviderKind::parse(&model_cfg.provider)
        .context("analysis.model.provider is not a known provider")?;
    Ok(build_model(ModelSettings {
        model_ref: ModelRef {
            provider,
            model_id: model_cfg.model_id.clone(),
            revision: model_cfg.revision.clone(),
        },
        base_url: model_cfg.base_url.clone(),
        api_key: secrets.model_api_key.clone(),
        timeout: Duration::from_secs(model_cfg.timeout_secs),
        max_output_tokens: model_cfg.max_output_tokens,
        thinking_enabled: model_cfg.thinking_enabled,
        thinking_budget: model_cfg.thinking_budget,
        pricing: Pricing {
            in_per_1k_microusd: model_cfg.price_in_microusd_per_1k,
            out_per_1k_microusd: model_cfg.price_out_microusd_per_1k,
        },
    }))
}

/// Spawn every pool. The returned [`Pipeline`] owns the tasks; call
/// [`Pipeline::shutdown`] to stop them within the grace period.
pub fn spawn_pipeline(
    pool: SqlitePool,
    broker: QueueBroker,
    cfg: &PipelineConfig,
    secrets: &ResolvedSecrets,
    scheduler_status: SharedSchedulerStatus,
) -> Result<Pipeline> {
    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    // Scheduler (single task).
    let scheduler = Scheduler::new(
        pool.clone(),
        broker.clone(),
        cfg.scheduler.dispatch_batch,
        cfg.scheduler.lease_secs,
        cfg.scheduler.tick_interval_secs,
    );
    tasks.spawn(scheduler.run_loop(cancel.clone(), scheduler_status));

    // Fetcher pool.
    let oracle = Arc::new(HttpTranscriptOracle::new(
        secrets.oracle_api_key.clone(),
        cfg.fetcher.oracle_base_url.clone(),
        Duration::from_secs(cfg.fetcher.oracle_timeout_secs),
    ));
    let bucket = Arc::new(TokenBucket::new(cfg.fetcher.oracle_qps));
    let fetcher = Arc::new(Fetcher::new(
        pool.clone(),
        broker.clone(),
        oracle,
        bucket,
    ));
    for worker_id in 0..cfg.fetcher.workers {
        tasks.spawn(Arc::clone(&fetcher).run_loop(worker_id, cancel.clone()));
    }

    // Analysis pool.
    let model = build_model_from_config(cfg, secrets)?;
    let analysis = Arc::new(AnalysisWorker::new(
        pool.clone(),
        broker.clone(),
        Arc::clone(&model),
        ContentStore::new(cfg.content_dir.clone()),
        Duration::from_secs(cfg.analysis.download_timeout_secs),
        cfg.analysis.default_prompt.clone(),
        cfg.analysis.queue_lease_secs,
    ));
    for worker_id in 0..cfg.analysis.workers {
        tasks.spawn(Arc::clone(&analysis).run_loop(worker_id, cancel.clone()));
    }

    // Email pool. An empty SMTP host disables the lane (dev setups); the
    // outbox still accumulates rows for inspection.
    if cfg.email.smtp_host.is_empty() {
        warn!("email.smtp_host unset; outbox lane disabled");
    } else {
        let mailer = Arc::new(
            SmtpMailer::new(
                &cfg.email.smtp_host,
                cfg.email.smtp_port,
                secrets.smtp_username.clone(),
                secrets.smtp_password.clone(),
                &cfg.email.from_address,
                Duration::from_secs(cfg.email.timeout_secs),
            )
            .context("smtp transport setup failed")?,
        );
        let email = Arc::new(EmailWorker::new(
            pool.clone(),
            mailer,
            cfg.email.batch,
            cfg.email.lease_secs,
            cfg.email.max_attempts,
        ));
        for worker_id in 0..cfg.email.workers {
            tasks.spawn(Arc::clone(&email).run_loop(worker_id, cancel.clone()));
        }
    }

    // Research coordinator (single task).
    let research = Arc::new(ResearchCoordinator::new(
        pool,
        broker,
        model,
        cfg.research.sweep_interval_secs,
    ));
    tasks.spawn(Arc::clone(&research).run_loop(cancel.clone()));

    Ok(Pipeline {
        cancel,
        tasks,
        research,
    })
}

impl Pipeline {
    /// Stop claiming new work and wait out the grace period. Workers that do
    /// not finish in time are abandoned; their leases expire and another
    /// process (or the next start) resumes the work.
    pub async fn shutdown(mut self, grace: Duration) {
        info!(grace_secs = grace.as_secs(), "pipeline shutting down");
        self.cancel.cancel();

        let drain = async {
            while self.tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("grace period elapsed; abandoning in-flight work to lease recovery");
            self.tasks.abort_all();
        }
        info!("pipeline stopped");
    }
}
