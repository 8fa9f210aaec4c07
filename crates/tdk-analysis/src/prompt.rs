//! Effective-prompt resolution for single-stock summaries.

use anyhow::Result;
use sqlx::SqlitePool;

use tdk_db::universe;

/// The prompt used to analyse a transcript for `equity_id`.
///
/// If the equity belongs to an active group with a non-empty
/// `stock_summary_prompt`, the lowest-id such group wins (deterministic when
/// an equity is in several groups); otherwise the configured default applies.
pub async fn resolve_stock_prompt(
    pool: &SqlitePool,
    equity_id: i64,
    default_prompt: &str,
) -> Result<String> {
    let groups = universe::active_groups_for_equity(pool, equity_id).await?;
    for group in groups {
        if let Some(prompt) = group.stock_summary_prompt {
            if !prompt.trim().is_empty() {
                return Ok(prompt);
            }
        }
    }
    Ok(default_prompt.to_string())
}
