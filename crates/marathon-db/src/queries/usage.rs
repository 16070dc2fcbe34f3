//! Database query functions for the `usage_records` table.
//!
//! One row per `(scope, subject)` pair: a task's lifetime totals, or a
//! user's running total across every task they have submitted.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;

use crate::models::{UsageRecordRow, UsageScope};

/// Accumulate a usage delta onto the `(scope, subject)` row, creating it if
/// absent. Mirrors the accumulate-then-flush shape used by the metering
/// aggregator: callers hand it deltas, never absolute totals.
pub async fn accumulate(
    pool: &PgPool,
    scope: UsageScope,
    subject: &str,
    input_tokens: i64,
    output_tokens: i64,
    compute_time_ms: i64,
    tool_calls: i64,
) -> Result<UsageRecordRow> {
    let row = sqlx::query_as::<_, UsageRecordRow>(
        "INSERT INTO usage_records (
            scope, subject, input_tokens, output_tokens, compute_time_ms, tool_calls, updated_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (scope, subject) DO UPDATE SET
            input_tokens = usage_records.input_tokens + EXCLUDED.input_tokens,
            output_tokens = usage_records.output_tokens + EXCLUDED.output_tokens,
            compute_time_ms = usage_records.compute_time_ms + EXCLUDED.compute_time_ms,
            tool_calls = usage_records.tool_calls + EXCLUDED.tool_calls,
            updated_at = EXCLUDED.updated_at
         RETURNING *",
    )
    .bind(scope)
    .bind(subject)
    .bind(input_tokens)
    .bind(output_tokens)
    .bind(compute_time_ms)
    .bind(tool_calls)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to accumulate usage record")?;
    Ok(row)
}

/// Fetch the usage total for a single `(scope, subject)` pair.
pub async fn get(pool: &PgPool, scope: UsageScope, subject: &str) -> Result<Option<UsageRecordRow>> {
    let row = sqlx::query_as::<_, UsageRecordRow>(
        "SELECT * FROM usage_records WHERE scope = $1 AND subject = $2",
    )
    .bind(scope)
    .bind(subject)
    .fetch_optional(pool)
    .await
    .context("failed to fetch usage record")?;
    Ok(row)
}

/// Fetch every row for a given scope. Used on startup to rehydrate the
/// metering aggregator's in-memory totals from the persisted ledger.
pub async fn list_by_scope(pool: &PgPool, scope: UsageScope) -> Result<Vec<UsageRecordRow>> {
    let rows =
        sqlx::query_as::<_, UsageRecordRow>("SELECT * FROM usage_records WHERE scope = $1")
            .bind(scope)
            .fetch_all(pool)
            .await
            .context("failed to list usage records")?;
    Ok(rows)
}
