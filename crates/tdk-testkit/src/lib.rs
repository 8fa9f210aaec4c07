//! Deterministic end-to-end harness for the pipeline.
//!
//! Real store, broker, and workers; scripted oracle/model/mailer; transcript
//! bodies served from a local mock HTTP server so the download + extraction
//! path runs for real. Time is synthetic: every pass takes `now` explicitly
//! and nothing sleeps.

use anyhow::Result;
use chrono::{DateTime, Utc};
use httpmock::MockServer;
use std::sync::Arc;
use tempfile::TempDir;

use tdk_analysis::{AnalysisWorker, ContentStore};
use tdk_email::EmailWorker;
use tdk_fetcher::{Fetcher, TokenBucket};
use tdk_queue::{names, QueueBroker, QueuePolicy};
use tdk_research::ResearchCoordinator;
use tdk_scheduler::{Scheduler, TickReport};

pub mod mocks;

pub use mocks::{
    RecordingMailer, ScriptedModel, ScriptedModelError, ScriptedOracle, ScriptedOracleError,
    SentEmail,
};

pub struct Harness {
    _dir: TempDir,
    pub pool: sqlx::SqlitePool,
    pub broker: QueueBroker,
    pub oracle: Arc<ScriptedOracle>,
    pub model: Arc<ScriptedModel>,
    pub mailer: Arc<RecordingMailer>,
    pub bucket: Arc<TokenBucket>,
    pub content_server: MockServer,
    scheduler: Scheduler,
    fetcher: Fetcher,
    analysis: AnalysisWorker,
    email: EmailWorker,
    pub research: ResearchCoordinator,
}

impl Harness {
    pub async fn new() -> Result<Harness> {
        let dir = tempfile::tempdir()?;
        let pool = tdk_db::connect(&dir.path().join("pipeline.db")).await?;
        tdk_db::migrate(&pool).await?;

        let broker = QueueBroker::new(pool.clone())
            .with_policy(
                names::TRANSCRIPT_CHECK,
                QueuePolicy {
                    lease: chrono::Duration::minutes(2),
                    max_attempts: 5,
                },
            )
            .with_policy(
                names::ANALYSIS_REQUEST,
                QueuePolicy {
                    lease: chrono::Duration::minutes(5),
                    max_attempts: 6,
                },
            )
            .with_policy(
                names::GROUP_RESEARCH_REQUEST,
                QueuePolicy {
                    lease: chrono::Duration::minutes(5),
                    max_attempts: 4,
                },
            );

        let oracle = Arc::new(ScriptedOracle::new());
        let model = Arc::new(ScriptedModel::new());
        let mailer = Arc::new(RecordingMailer::new());
        let bucket = Arc::new(TokenBucket::new(100.0));
        let content_server = MockServer::start_async().await;

        let scheduler = Scheduler::new(pool.clone(), broker.clone(), 16, 600, 1);
        let fetcher = Fetcher::new(
            pool.clone(),
            broker.clone(),
            Arc::clone(&oracle) as Arc<dyn tdk_fetcher::TranscriptOracle>,
            Arc::clone(&bucket),
        );
        let analysis = AnalysisWorker::new(
            pool.clone(),
            broker.clone(),
            Arc::clone(&model) as Arc<dyn tdk_llm::LanguageModel>,
            ContentStore::new(dir.path().join("content")),
            std::time::Duration::from_secs(5),
            "Summarise this earnings call transcript.".to_string(),
            300,
        );
        let email = EmailWorker::new(
            pool.clone(),
            Arc::clone(&mailer) as Arc<dyn tdk_email::Mailer>,
            16,
            120,
            8,
        );
        let research = ResearchCoordinator::new(
            pool.clone(),
            broker.clone(),
            Arc::clone(&model) as Arc<dyn tdk_llm::LanguageModel>,
            900,
        );

        Ok(Harness {
            _dir: dir,
            pool,
            broker,
            oracle,
            model,
            mailer,
            bucket,
            content_server,
            scheduler,
            fetcher,
            analysis,
            email,
            research,
        })
    }

    // -- seeding -----------------------------------------------------------

    pub async fn add_equity(&self, symbol: &str, identifier: &str) -> Result<i64> {
        tdk_db::universe::upsert_equity(
            &self.pool,
            symbol,
            None,
            identifier,
            &format!("{symbol} Incorporated"),
        )
        .await
    }

    pub async fn add_watched_equity(
        &self,
        symbol: &str,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let equity_id = self.add_equity(symbol, identifier).await?;
        tdk_db::universe::watchlist_add(&self.pool, equity_id, now).await?;
        Ok(equity_id)
    }

    pub async fn add_recipient(&self, email: &str, now: DateTime<Utc>) -> Result<()> {
        tdk_db::universe::recipient_add(&self.pool, email, now).await?;
        Ok(())
    }

    /// Register a transcript body on the content server and return its URL.
    pub async fn serve_transcript(&self, path: &str, body: &str) -> String {
        let body = body.to_string();
        let path_owned = path.to_string();
        self.content_server
            .mock_async(move |when, then| {
                when.method(httpmock::Method::GET).path(path_owned.clone());
                then.status(200).body(body.clone());
            })
            .await;
        self.content_server.url(path)
    }

    // -- single-step drivers ----------------------------------------------

    pub async fn scheduler_tick(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        self.scheduler.tick(now).await
    }

    pub async fn fetch_pass(&self, now: DateTime<Utc>) -> Result<usize> {
        let batch = self.broker.claim(names::TRANSCRIPT_CHECK, 16, now).await?;
        for delivery in &batch {
            self.fetcher.process_delivery(delivery, now).await?;
        }
        Ok(batch.len())
    }

    pub async fn analysis_pass(&self, now: DateTime<Utc>) -> Result<usize> {
        let batch = self.broker.claim(names::ANALYSIS_REQUEST, 16, now).await?;
        for delivery in &batch {
            self.analysis.process_delivery(delivery, now).await?;
        }
        Ok(batch.len())
    }

    pub async fn research_pass(&self, now: DateTime<Utc>) -> Result<usize> {
        let batch = self
            .broker
            .claim(names::GROUP_RESEARCH_REQUEST, 16, now)
            .await?;
        for delivery in &batch {
            self.research.process_delivery(delivery, now).await?;
        }
        Ok(batch.len())
    }

    pub async fn email_pass(&self, now: DateTime<Utc>) -> Result<usize> {
        self.email.drain_once(now).await
    }

    /// Run worker passes at a fixed instant until no lane has visible work.
    /// Messages parked behind a backoff horizon stay parked — advance `now`
    /// and call again to model time passing.
    pub async fn settle(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut total = 0;
        for _ in 0..32 {
            let mut round = 0;
            round += self.fetch_pass(now).await?;
            round += self.analysis_pass(now).await?;
            round += self.research_pass(now).await?;
            round += self.email_pass(now).await?;
            if round == 0 {
                return Ok(total);
            }
            total += round;
        }
        anyhow::bail!("settle did not converge in 32 rounds");
    }
}
