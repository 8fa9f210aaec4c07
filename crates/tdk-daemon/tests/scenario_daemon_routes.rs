//! Scenario: admin surface contract.
//!
//! Exercises the bare router in process via `tower::ServiceExt::oneshot`,
//! backed by a throwaway database and a no-op model.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use tower::ServiceExt;

use tdk_daemon::{routes, state::AppState};
use tdk_llm::{GenerateRequest, Generation, LanguageModel, ModelError, ModelRef, ProviderKind};
use tdk_queue::{names, QueueBroker};
use tdk_research::ResearchCoordinator;

struct NoopModel {
    model_ref: ModelRef,
}

#[async_trait::async_trait]
impl LanguageModel for NoopModel {
    fn model_ref(&self) -> &ModelRef {
        &self.model_ref
    }

    async fn generate(&self, _req: &GenerateRequest) -> Result<Generation, ModelError> {
        Ok(Generation {
            output_text: "noop".to_string(),
            tokens_in: 0,
            tokens_out: 0,
            cost_microusd: 0,
        })
    }
}

async fn make_state() -> anyhow::Result<(tempfile::TempDir, Arc<AppState>)> {
    let dir = tempfile::tempdir()?;
    let pool = tdk_db::connect(&dir.path().join("pipeline.db")).await?;
    tdk_db::migrate(&pool).await?;

    let broker = QueueBroker::new(pool.clone());
    let model: Arc<dyn LanguageModel> = Arc::new(NoopModel {
        model_ref: ModelRef {
            provider: ProviderKind::OpenAiCompatible,
            model_id: "noop".to_string(),
            revision: None,
        },
    });
    let research = Arc::new(ResearchCoordinator::new(
        pool.clone(),
        broker.clone(),
        model,
        900,
    ));
    let state = Arc::new(AppState::new(
        pool,
        broker,
        tdk_scheduler::shared_status(1),
        research,
        tdk_config::PipelineConfig::default(),
    ));
    Ok((dir, state))
}

async fn body_json(resp: axum::response::Response) -> anyhow::Result<serde_json::Value> {
    let bytes = resp.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

#[tokio::test]
async fn health_reports_service_and_version() -> anyhow::Result<()> {
    let (_dir, state) = make_state().await?;
    let app = routes::build_router(state);

    let resp = app
        .oneshot(Request::get("/v1/health").body(Body::empty())?)
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await?;
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "tdk-daemon");
    Ok(())
}

#[tokio::test]
async fn scheduler_trigger_publishes_a_poke() -> anyhow::Result<()> {
    let (_dir, state) = make_state().await?;
    let broker = state.broker.clone();
    let app = routes::build_router(state);

    let resp = app
        .oneshot(Request::post("/scheduler/trigger").body(Body::empty())?)
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await?;
    assert_eq!(json["already_polling"], false);

    let depth = broker.depth(names::SCHEDULER_TICK, Utc::now()).await?;
    assert_eq!(depth.ready, 1, "trigger must enqueue one zero-delay poke");
    Ok(())
}

#[tokio::test]
async fn scheduler_trigger_returns_202_while_polling() -> anyhow::Result<()> {
    let (_dir, state) = make_state().await?;
    state.scheduler_status.write().await.is_polling = true;
    let app = routes::build_router(state);

    let resp = app
        .oneshot(Request::post("/scheduler/trigger").body(Body::empty())?)
        .await?;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let json = body_json(resp).await?;
    assert_eq!(json["already_polling"], true);
    Ok(())
}

#[tokio::test]
async fn analyze_without_transcript_is_404() -> anyhow::Result<()> {
    let (_dir, state) = make_state().await?;
    let app = routes::build_router(state);

    let resp = app
        .oneshot(
            Request::post("/analyze/42")
                .header("content-type", "application/json")
                .body(Body::from("{}"))?,
        )
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn analyze_creates_job_once_and_force_mints_a_fresh_key() -> anyhow::Result<()> {
    let (_dir, state) = make_state().await?;
    let now = Utc.with_ymd_and_hms(2026, 7, 10, 9, 0, 0).unwrap();
    let equity_id =
        tdk_db::universe::upsert_equity(&state.pool, "ACME", None, "US-ACME", "Acme Corp").await?;
    tdk_db::transcripts::upsert_available(
        &state.pool,
        equity_id,
        2,
        2026,
        "https://host/a",
        None,
        now,
    )
    .await?;

    let body = r#"{"quarter": 2, "year": 2026}"#;
    let app = routes::build_router(Arc::clone(&state));
    let resp = app
        .oneshot(
            Request::post(format!("/analyze/{equity_id}"))
                .header("content-type", "application/json")
                .body(Body::from(body))?,
        )
        .await?;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let first = body_json(resp).await?;
    assert_eq!(first["job_created"], true);

    // Same request again: deduplicated on the idempotency key.
    let app = routes::build_router(Arc::clone(&state));
    let resp = app
        .oneshot(
            Request::post(format!("/analyze/{equity_id}"))
                .header("content-type", "application/json")
                .body(Body::from(body))?,
        )
        .await?;
    let second = body_json(resp).await?;
    assert_eq!(second["job_created"], false);
    assert_eq!(first["idempotency_key"], second["idempotency_key"]);

    // Force: a fresh key and a second job.
    let app = routes::build_router(Arc::clone(&state));
    let resp = app
        .oneshot(
            Request::post(format!("/analyze/{equity_id}"))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"force": true, "quarter": 2, "year": 2026}"#))?,
        )
        .await?;
    let forced = body_json(resp).await?;
    assert_eq!(forced["job_created"], true);
    assert_ne!(first["idempotency_key"], forced["idempotency_key"]);

    let depth = state.broker.depth(names::ANALYSIS_REQUEST, Utc::now()).await?;
    assert_eq!(depth.ready, 2, "two distinct jobs → two requests");
    Ok(())
}

#[tokio::test]
async fn group_articles_force_creates_the_run() -> anyhow::Result<()> {
    let (_dir, state) = make_state().await?;
    let app = routes::build_router(Arc::clone(&state));

    let resp = app
        .oneshot(
            Request::post("/groups/9/articles")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"quarter": 2, "year": 2026}"#))?,
        )
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let group_id =
        tdk_db::universe::create_group(&state.pool, "semis", Some("Write the article."), None)
            .await?;
    let app = routes::build_router(Arc::clone(&state));
    let resp = app
        .oneshot(
            Request::post(format!("/groups/{group_id}/articles"))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"quarter": 2, "year": 2026}"#))?,
        )
        .await?;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let run = tdk_db::research::fetch_run(&state.pool, group_id, 2, 2026)
        .await?
        .expect("force must create the run");
    assert_eq!(run.status, "pending");

    let depth = state
        .broker
        .depth(names::GROUP_RESEARCH_REQUEST, Utc::now())
        .await?;
    assert_eq!(depth.ready, 1, "force must dispatch stage 2");
    Ok(())
}
