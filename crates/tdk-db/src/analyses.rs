//! Stored language-model analyses.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::is_unique_violation;

#[derive(Debug, Clone, FromRow)]
pub struct AnalysisRow {
    pub analysis_id: i64,
    pub transcript_id: i64,
    pub idempotency_key: String,
    pub prompt_snapshot: String,
    pub output_text: String,
    pub model_provider: String,
    pub model_id: String,
    pub model_revision: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_microusd: i64,
    pub created_at_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub transcript_id: i64,
    pub idempotency_key: String,
    pub prompt_snapshot: String,
    pub output_text: String,
    pub model_provider: String,
    pub model_id: String,
    pub model_revision: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_microusd: i64,
}

const ANALYSIS_COLUMNS: &str = "analysis_id, transcript_id, idempotency_key, prompt_snapshot, \
     output_text, model_provider, model_id, model_revision, tokens_in, tokens_out, \
     cost_microusd, created_at_utc";

/// Commit a finished analysis: insert the row and flip the owning transcript
/// to `done` in one transaction, so an outbox fan-out can never observe an
/// analysis that is not durably committed.
///
/// A duplicate idempotency key means another worker already committed this
/// unit of work (crash-retry overlap); the transcript is still marked `done`
/// and the existing analysis id is returned.
pub async fn complete_analysis(
    pool: &SqlitePool,
    new: &NewAnalysis,
    now: DateTime<Utc>,
) -> Result<i64> {
    let mut tx = pool.begin().await.context("complete_analysis begin failed")?;

    let inserted: Result<(i64,), sqlx::Error> = sqlx::query_as(
        r#"
        insert into transcript_analyses
            (transcript_id, idempotency_key, prompt_snapshot, output_text,
             model_provider, model_id, model_revision, tokens_in, tokens_out,
             cost_microusd, created_at_utc)
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        returning analysis_id
        "#,
    )
    .bind(new.transcript_id)
    .bind(&new.idempotency_key)
    .bind(&new.prompt_snapshot)
    .bind(&new.output_text)
    .bind(&new.model_provider)
    .bind(&new.model_id)
    .bind(&new.model_revision)
    .bind(new.tokens_in)
    .bind(new.tokens_out)
    .bind(new.cost_microusd)
    .bind(now)
    .fetch_one(&mut *tx)
    .await;

    let analysis_id = match inserted {
        Ok((id,)) => id,
        Err(e) if is_unique_violation(&e) => {
            let (id,): (i64,) = sqlx::query_as(
                "select analysis_id from transcript_analyses where idempotency_key = ?1",
            )
            .bind(&new.idempotency_key)
            .fetch_one(&mut *tx)
            .await
            .context("complete_analysis duplicate lookup failed")?;
            id
        }
        Err(e) => return Err(anyhow::Error::new(e).context("complete_analysis insert failed")),
    };

    sqlx::query(
        r#"
        update transcripts
           set analysis_status = 'done',
               analysis_error = null,
               updated_at_utc = ?2
         where transcript_id = ?1
        "#,
    )
    .bind(new.transcript_id)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("complete_analysis transcript update failed")?;

    tx.commit().await.context("complete_analysis commit failed")?;
    Ok(analysis_id)
}

pub async fn fetch_analysis(pool: &SqlitePool, analysis_id: i64) -> Result<Option<AnalysisRow>> {
    let sql = format!("select {ANALYSIS_COLUMNS} from transcript_analyses where analysis_id = ?1");
    sqlx::query_as::<_, AnalysisRow>(&sql)
        .bind(analysis_id)
        .fetch_optional(pool)
        .await
        .context("fetch_analysis failed")
}

pub async fn latest_for_transcript(
    pool: &SqlitePool,
    transcript_id: i64,
) -> Result<Option<AnalysisRow>> {
    let sql = format!(
        "select {ANALYSIS_COLUMNS} from transcript_analyses \
         where transcript_id = ?1 order by analysis_id desc limit 1"
    );
    sqlx::query_as::<_, AnalysisRow>(&sql)
        .bind(transcript_id)
        .fetch_optional(pool)
        .await
        .context("latest_for_transcript failed")
}

/// Number of stored analyses for a transcript — the force-generation counter
/// that keeps a forced idempotency key distinct from every prior one.
pub async fn count_for_transcript(pool: &SqlitePool, transcript_id: i64) -> Result<i64> {
    let (n,): (i64,) =
        sqlx::query_as("select count(*) from transcript_analyses where transcript_id = ?1")
            .bind(transcript_id)
            .fetch_one(pool)
            .await
            .context("count_for_transcript failed")?;
    Ok(n)
}
