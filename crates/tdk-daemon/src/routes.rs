//! Axum router and all HTTP handlers for the admin surface.
//!
//! `build_router` is the single entry point; `main.rs` attaches middleware
//! after this call so the scenario tests can compose the bare router.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use tracing::info;

use tdk_db::{analyses, jobs, transcripts, universe, views};
use tdk_queue::names;
use tdk_scheduler::calendar;
use tdk_schemas::{AnalysisRequest, SchedulerTick};

use crate::api_types::{
    AnalyzeRequestBody, AnalyzeResponse, ArticlesRequestBody, ArticlesResponse, ErrorResponse,
    HealthResponse, PipelineEquityStatus, PipelineStatusResponse, QueueStatusEntry,
    QueuesStatusResponse, SchedulerStatusResponse, TriggerResponse,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/scheduler/status", get(scheduler_status))
        .route("/scheduler/trigger", post(scheduler_trigger))
        .route("/analyze/:equity_id", post(analyze))
        .route("/groups/:group_id/articles", post(group_articles))
        .route("/v1/queues/status", get(queues_status))
        .route("/v1/pipeline/status", get(pipeline_status))
        .with_state(state)
}

fn internal_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %format!("{err:#}"), "handler failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: format!("{err:#}"),
        }),
    )
        .into_response()
}

fn not_found(msg: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /scheduler/status
// ---------------------------------------------------------------------------

pub(crate) async fn scheduler_status(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let snap = st.scheduler_status.read().await.clone();
    let now = Utc::now();
    let next_poll_in_seconds = snap
        .next_poll_at
        .map(|t| (t - now).num_seconds().max(0));

    (
        StatusCode::OK,
        Json(SchedulerStatusResponse {
            scheduler_running: snap.scheduler_running,
            is_polling: snap.is_polling,
            poll_interval_seconds: snap.poll_interval_seconds,
            next_poll_at: snap.next_poll_at,
            next_poll_in_seconds,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /scheduler/trigger
// ---------------------------------------------------------------------------

/// Force an immediate dispatch tick by publishing a zero-delay poke on the
/// trigger lane. Returns 202 when a dispatch pass is already underway.
pub(crate) async fn scheduler_trigger(State(st): State<Arc<AppState>>) -> Response {
    let already_polling = st.scheduler_status.read().await.is_polling;
    if already_polling {
        return (
            StatusCode::ACCEPTED,
            Json(TriggerResponse {
                accepted: true,
                already_polling: true,
            }),
        )
            .into_response();
    }

    let now = Utc::now();
    let poke = SchedulerTick {
        requested_at_utc: now,
    };
    if let Err(e) = st
        .broker
        .publish(names::SCHEDULER_TICK, &poke, Duration::zero(), now)
        .await
    {
        return internal_error(e);
    }

    info!("scheduler trigger published");
    (
        StatusCode::OK,
        Json(TriggerResponse {
            accepted: true,
            already_polling: false,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// POST /analyze/{equity_id}
// ---------------------------------------------------------------------------

/// Insert an `AnalysisJob` and publish the matching request.
///
/// Without an explicit quarter the current fiscal target applies. A `force`
/// request derives a fresh idempotency key from the stored analysis count,
/// so it coexists with (and never collides with) the poll path.
pub(crate) async fn analyze(
    State(st): State<Arc<AppState>>,
    Path(equity_id): Path<i64>,
    Json(body): Json<AnalyzeRequestBody>,
) -> Response {
    let now = Utc::now();
    let target = calendar::target_for(now.date_naive());
    let quarter = body.quarter.unwrap_or(target.quarter);
    let year = body.year.unwrap_or(target.year);
    if !(1..=4).contains(&quarter) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse {
                error: format!("quarter must be 1..=4, got {quarter}"),
            }),
        )
            .into_response();
    }

    let transcript = match transcripts::fetch_transcript_by_key(&st.pool, equity_id, quarter, year)
        .await
    {
        Ok(Some(t)) => t,
        Ok(None) => return not_found("no transcript recorded for that equity and quarter"),
        Err(e) => return internal_error(e),
    };
    let Some(source_url) = transcript.source_url.clone() else {
        return not_found("transcript has no source url yet");
    };

    let generation = if body.force {
        match analyses::count_for_transcript(&st.pool, transcript.transcript_id).await {
            Ok(n) => n + 1,
            Err(e) => return internal_error(e),
        }
    } else {
        0
    };
    let key = jobs::idempotency_key(transcript.transcript_id, &source_url, generation);

    let created = match jobs::insert_job_deduped(
        &st.pool,
        transcript.transcript_id,
        &key,
        body.force,
        now,
    )
    .await
    {
        Ok(created) => created.is_some(),
        Err(e) => return internal_error(e),
    };

    if created {
        let request = AnalysisRequest {
            transcript_id: transcript.transcript_id,
            source_url,
            force: body.force,
            idempotency_key: key.clone(),
        };
        if let Err(e) = st
            .broker
            .publish(names::ANALYSIS_REQUEST, &request, Duration::zero(), now)
            .await
        {
            return internal_error(e);
        }
        info!(
            equity_id,
            transcript_id = transcript.transcript_id,
            force = body.force,
            "analysis job accepted"
        );
    }

    (
        StatusCode::ACCEPTED,
        Json(AnalyzeResponse {
            transcript_id: transcript.transcript_id,
            idempotency_key: key,
            job_created: created,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// POST /groups/{id}/articles
// ---------------------------------------------------------------------------

/// Create or re-open a research run with `force=true` — the fan-in check is
/// bypassed and missing members are skipped.
pub(crate) async fn group_articles(
    State(st): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Json(body): Json<ArticlesRequestBody>,
) -> Response {
    match universe::fetch_group(&st.pool, group_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("group does not exist"),
        Err(e) => return internal_error(e),
    }
    if !(1..=4).contains(&body.quarter) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse {
                error: format!("quarter must be 1..=4, got {}", body.quarter),
            }),
        )
            .into_response();
    }

    let run_id = match st
        .research
        .force_run(group_id, body.quarter, body.year, Utc::now())
        .await
    {
        Ok(run_id) => run_id,
        Err(e) => return internal_error(e),
    };

    (
        StatusCode::ACCEPTED,
        Json(ArticlesResponse {
            run_id,
            group_id,
            quarter: body.quarter,
            year: body.year,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/queues/status
// ---------------------------------------------------------------------------

pub(crate) async fn queues_status(State(st): State<Arc<AppState>>) -> Response {
    let now = Utc::now();
    let mut queues = Vec::new();
    for queue in [
        names::TRANSCRIPT_CHECK,
        names::ANALYSIS_REQUEST,
        names::GROUP_RESEARCH_REQUEST,
        names::SCHEDULER_TICK,
    ] {
        match st.broker.depth(queue, now).await {
            Ok(depth) => queues.push(QueueStatusEntry {
                queue: queue.to_string(),
                ready: depth.ready,
                delayed: depth.delayed,
                in_flight: depth.in_flight,
                dead: depth.dead,
            }),
            Err(e) => return internal_error(e),
        }
    }
    (StatusCode::OK, Json(QueuesStatusResponse { queues })).into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/pipeline/status
// ---------------------------------------------------------------------------

pub(crate) async fn pipeline_status(State(st): State<Arc<AppState>>) -> Response {
    let now = Utc::now();
    let target = calendar::target_for(now.date_naive());

    let rows = match views::pipeline_overview(&st.pool, target.quarter, target.year).await {
        Ok(rows) => rows,
        Err(e) => return internal_error(e),
    };

    let equities = rows
        .into_iter()
        .map(|r| PipelineEquityStatus {
            equity_id: r.equity_id,
            symbol: r.symbol,
            on_watchlist: r.on_watchlist,
            quarter: target.quarter,
            year: target.year,
            transcript_status: r.transcript_status,
            analysis_status: r.analysis_status,
            schedule_attempts: r.schedule_attempts,
            next_check_at: r.next_check_at_utc,
            last_status: r.last_status,
        })
        .collect();

    (
        StatusCode::OK,
        Json(PipelineStatusResponse {
            quarter: target.quarter,
            year: target.year,
            equities,
        }),
    )
        .into_response()
}
