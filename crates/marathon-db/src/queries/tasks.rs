use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{TaskRow, TaskState};

/// Insert a newly-submitted task row. Always inserted in the `queued` state.
pub async fn insert_task(pool: &PgPool, task: &TaskRow) -> Result<TaskRow> {
    let row = sqlx::query_as::<_, TaskRow>(
        "INSERT INTO tasks (
            id, state, assigned_node_id, user_id, repo_url, branch, prompt,
            github_token, create_pr, pr_title, pr_body, env_vars, max_iterations,
            completion_promise, required_capabilities, created_at, started_at,
            completed_at, error_message, pr_url, input_tokens, output_tokens,
            compute_time_ms, tool_calls, retry_count
         ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
            $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25
         )
         RETURNING *",
    )
    .bind(&task.id)
    .bind(task.state)
    .bind(&task.assigned_node_id)
    .bind(task.user_id)
    .bind(&task.repo_url)
    .bind(&task.branch)
    .bind(&task.prompt)
    .bind(&task.github_token)
    .bind(task.create_pr)
    .bind(&task.pr_title)
    .bind(&task.pr_body)
    .bind(&task.env_vars)
    .bind(task.max_iterations)
    .bind(&task.completion_promise)
    .bind(&task.required_capabilities)
    .bind(task.created_at)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(&task.error_message)
    .bind(&task.pr_url)
    .bind(task.input_tokens)
    .bind(task.output_tokens)
    .bind(task.compute_time_ms)
    .bind(task.tool_calls)
    .bind(task.retry_count)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;
    Ok(row)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: &str) -> Result<Option<TaskRow>> {
    let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;
    Ok(row)
}

/// List every task belonging to a user, most recently created first.
pub async fn list_tasks_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<TaskRow>> {
    let rows = sqlx::query_as::<_, TaskRow>(
        "SELECT * FROM tasks WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for user")?;
    Ok(rows)
}

/// List every task currently in one of the given states, oldest first.
///
/// Used by the recovery loader to find tasks left `starting`/`running` by a
/// crashed orchestrator, and by the scheduler to rebuild its queue ordering.
pub async fn list_tasks_in_states(pool: &PgPool, states: &[TaskState]) -> Result<Vec<TaskRow>> {
    let state_strs: Vec<String> = states.iter().map(|s| s.to_string()).collect();
    let rows = sqlx::query_as::<_, TaskRow>(
        "SELECT * FROM tasks WHERE state = ANY($1) ORDER BY created_at ASC",
    )
    .bind(&state_strs)
    .fetch_all(pool)
    .await
    .context("failed to list tasks in states")?;
    Ok(rows)
}

/// Compare-and-swap a task's state. Returns `true` if the row matched and was
/// updated, `false` if the current state no longer matched `from` (lost the
/// race to a concurrent writer) or the task does not exist.
pub async fn transition_state(
    pool: &PgPool,
    id: &str,
    from: TaskState,
    to: TaskState,
) -> Result<bool> {
    let result = sqlx::query("UPDATE tasks SET state = $1 WHERE id = $2 AND state = $3")
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(pool)
        .await
        .context("failed to transition task state")?;
    Ok(result.rows_affected() > 0)
}

/// Transition `queued -> starting`, recording which node the task was
/// dispatched to.
pub async fn assign_to_node(pool: &PgPool, id: &str, node_id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks SET state = 'starting', assigned_node_id = $1 \
         WHERE id = $2 AND state = 'queued'",
    )
    .bind(node_id)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to assign task to node")?;
    Ok(result.rows_affected() > 0)
}

/// Transition `starting -> running`, setting `started_at`.
pub async fn mark_running(pool: &PgPool, id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks SET state = 'running', started_at = $1 \
         WHERE id = $2 AND state = 'starting'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark task running")?;
    Ok(result.rows_affected() > 0)
}

/// Unconditionally reassign a task back to `queued`, clearing its node
/// assignment. Used for retry-on-timeout and node-loss recovery, where the
/// caller has already decided the transition is valid for the task's current
/// state.
pub async fn requeue(pool: &PgPool, id: &str, from: TaskState) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks SET state = 'queued', assigned_node_id = NULL \
         WHERE id = $1 AND state = $2",
    )
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to requeue task")?;
    Ok(result.rows_affected() > 0)
}

/// Mark a task `completed`, recording the PR URL if one was opened.
pub async fn mark_completed(pool: &PgPool, id: &str, pr_url: Option<&str>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks SET state = 'completed', completed_at = $1, pr_url = $2 \
         WHERE id = $3 AND state = 'running'",
    )
    .bind(Utc::now())
    .bind(pr_url)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark task completed")?;
    Ok(result.rows_affected() > 0)
}

/// Mark a task `failed` from any non-terminal state, recording the error.
pub async fn mark_failed(pool: &PgPool, id: &str, error_message: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks SET state = 'failed', completed_at = $1, error_message = $2 \
         WHERE id = $3 AND state IN ('queued', 'starting', 'running')",
    )
    .bind(Utc::now())
    .bind(error_message)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark task failed")?;
    Ok(result.rows_affected() > 0)
}

/// Mark a task `cancelled` from any non-terminal state.
pub async fn mark_cancelled(pool: &PgPool, id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks SET state = 'cancelled', completed_at = $1 \
         WHERE id = $2 AND state IN ('queued', 'starting', 'running')",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark task cancelled")?;
    Ok(result.rows_affected() > 0)
}

/// Increment the retry counter and return the new value.
pub async fn increment_retry_count(pool: &PgPool, id: &str) -> Result<i32> {
    let (retry_count,): (i32,) = sqlx::query_as(
        "UPDATE tasks SET retry_count = retry_count + 1 WHERE id = $1 RETURNING retry_count",
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .context("failed to increment task retry count")?;
    Ok(retry_count)
}

/// Accumulate usage counters onto a task row. Called once per usage event
/// received from a worker; the running totals are the source a client reads
/// when polling a task's usage.
pub async fn accumulate_usage(
    pool: &PgPool,
    id: &str,
    input_tokens: i64,
    output_tokens: i64,
    compute_time_ms: i64,
    tool_calls: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET \
            input_tokens = input_tokens + $1, \
            output_tokens = output_tokens + $2, \
            compute_time_ms = compute_time_ms + $3, \
            tool_calls = tool_calls + $4 \
         WHERE id = $5",
    )
    .bind(input_tokens)
    .bind(output_tokens)
    .bind(compute_time_ms)
    .bind(tool_calls)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to accumulate task usage")?;
    Ok(())
}

/// Bulk-reset every task left `starting` or `running` back to `queued`,
/// clearing node assignments. Run once at orchestrator startup before the
/// scheduler begins dispatching, since no node from a prior process
/// lifetime can still be running that task.
pub async fn reset_orphaned_tasks(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET state = 'queued', assigned_node_id = NULL \
         WHERE state IN ('starting', 'running')",
    )
    .execute(pool)
    .await
    .context("failed to reset orphaned tasks")?;
    Ok(result.rows_affected())
}
