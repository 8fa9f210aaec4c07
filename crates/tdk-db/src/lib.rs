//! Store layer: a single SQLite database file holding every durable entity of
//! the transcript pipeline (universe, schedule, transcripts, queue, jobs,
//! analyses, outbox, research runs).
//!
//! Contended paths (schedule claim, queue claim, outbox claim, reservation
//! CAS) are single `UPDATE … RETURNING` statements, atomic under SQLite's
//! writer serialisation. Multi-row transitions run inside one transaction.
//! SQL never reads the wall clock — callers pass `now`.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub mod analyses;
pub mod jobs;
pub mod outbox;
pub mod queue;
pub mod research;
pub mod schedule;
pub mod transcripts;
pub mod universe;
pub mod views;

pub use analyses::{AnalysisRow, NewAnalysis};
pub use jobs::{JobRow, JobStatus};
pub use outbox::{OutboxRow, OutboxStatus};
pub use queue::{DeadLetterRow, MessageRow, QueueDepth};
pub use research::{MemberAnalysis, ResearchRunRow, ResearchStatus};
pub use schedule::ScheduleRow;
pub use transcripts::{AnalysisState, TranscriptRow, TranscriptStatus};
pub use universe::{EquityRow, GroupRow, RecipientRow, TrackedEquity};

pub const ENV_DB_PATH: &str = "TDK_DATABASE_PATH";

/// Open (creating if missing) the database file and configure the connection:
/// WAL journal for concurrent readers, foreign keys on, and a busy timeout so
/// writer contention surfaces as latency instead of `SQLITE_BUSY` errors.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(opts)
        .await
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    Ok(pool)
}

/// Connect using a SQLite URL (tests use `sqlite::memory:`-style URLs and
/// tempfiles interchangeably).
pub async fn connect_url(url: &str) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid database url {url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(opts)
        .await
        .with_context(|| format!("failed to open database {url}"))?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &SqlitePool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from sqlite_master
            where type = 'table' and name = 'fetch_schedule'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_schema: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_schema: bool,
}

/// Detect a SQLite unique-constraint violation.
///
/// Constraint violations are *permanent* per the error taxonomy: callers turn
/// them into idempotent no-ops (`Ok(false)` from the `*_deduped` insert
/// helpers) rather than retrying.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            // 2067 = SQLITE_CONSTRAINT_UNIQUE, 1555 = SQLITE_CONSTRAINT_PRIMARYKEY
            matches!(db_err.code().as_deref(), Some("2067") | Some("1555"))
        }
        _ => false,
    }
}
