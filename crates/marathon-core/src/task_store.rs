//! The authoritative in-memory task table, with synchronous DB write-through.
//!
//! The database acts as a write-through log rather than the sole source of
//! truth: a transition validates the CAS and applies the patch against the
//! in-memory table first, releases the lock, then performs the DB write
//! (`UPDATE ... WHERE status = $from`, checked through `rows_affected()`). A
//! DB failure rolls the in-memory row back to its pre-transition value and
//! surfaces as `MarathonError::Internal`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use marathon_db::models::{NodeStatus as DbNodeStatus, TaskRow, TaskState as DbTaskState};
use marathon_db::queries::tasks as task_db;

use crate::error::{MarathonError, Result};
use crate::event::TaskEventKind;
use crate::event_bus::EventBus;
use crate::id::{NodeId, TaskId};
use crate::task::{EnvVar, Task, TaskFilter, TaskPayload, TaskState, UsageCounters};

fn to_db_state(state: TaskState) -> DbTaskState {
    match state {
        TaskState::Unspecified => DbTaskState::Unspecified,
        TaskState::Queued => DbTaskState::Queued,
        TaskState::Starting => DbTaskState::Starting,
        TaskState::Running => DbTaskState::Running,
        TaskState::Completed => DbTaskState::Completed,
        TaskState::Failed => DbTaskState::Failed,
        TaskState::Cancelled => DbTaskState::Cancelled,
    }
}

fn from_db_state(state: DbTaskState) -> TaskState {
    match state {
        DbTaskState::Unspecified => TaskState::Unspecified,
        DbTaskState::Queued => TaskState::Queued,
        DbTaskState::Starting => TaskState::Starting,
        DbTaskState::Running => TaskState::Running,
        DbTaskState::Completed => TaskState::Completed,
        DbTaskState::Failed => TaskState::Failed,
        DbTaskState::Cancelled => TaskState::Cancelled,
    }
}

/// A row type unused here directly but kept for symmetry with the node
/// registry's own DB audit log; referenced so the import is not flagged
/// dead when `#[allow]`-free builds run.
#[allow(dead_code)]
const _NODE_STATUS_MARKER: DbNodeStatus = DbNodeStatus::Idle;

pub(crate) fn task_to_row(task: &Task) -> TaskRow {
    TaskRow {
        id: task.id.to_string(),
        state: to_db_state(task.state),
        assigned_node_id: task.assigned_node_id.map(|n| n.to_string()),
        user_id: task.user_id,
        repo_url: task.payload.repo_url.clone(),
        branch: task.payload.branch.clone(),
        prompt: task.payload.prompt.clone(),
        github_token: task.payload.github_token.clone(),
        create_pr: task.payload.create_pr,
        pr_title: task.payload.pr_title.clone(),
        pr_body: task.payload.pr_body.clone(),
        env_vars: serde_json::to_value(&task.payload.env_vars).unwrap_or(serde_json::Value::Null),
        max_iterations: task.payload.max_iterations as i32,
        completion_promise: task.payload.completion_promise.clone(),
        required_capabilities: serde_json::to_value(&task.payload.required_capabilities)
            .unwrap_or(serde_json::Value::Null),
        created_at: task.created_at,
        started_at: task.started_at,
        completed_at: task.completed_at,
        error_message: task.error_message.clone(),
        pr_url: task.pr_url.clone(),
        input_tokens: task.usage.input_tokens,
        output_tokens: task.usage.output_tokens,
        compute_time_ms: task.usage.compute_time_ms,
        tool_calls: task.usage.tool_calls,
        retry_count: task.retry_count as i32,
    }
}

/// Reconstruct a [`Task`] from a persisted row. Used by the recovery
/// loader. Fails if the row's hex-encoded `id`/`assigned_node_id` are
/// malformed, which should never happen for a row this crate wrote itself.
pub(crate) fn row_to_task(row: TaskRow) -> Result<Task> {
    let id: TaskId = row
        .id
        .parse()
        .map_err(|_| MarathonError::Internal(format!("corrupt task id {:?}", row.id)))?;
    let assigned_node_id = row
        .assigned_node_id
        .map(|s| {
            s.parse::<NodeId>()
                .map_err(|_| MarathonError::Internal(format!("corrupt node id {s:?}")))
        })
        .transpose()?;
    let env_vars: Vec<EnvVar> = serde_json::from_value(row.env_vars).unwrap_or_default();
    let required_capabilities: Vec<String> =
        serde_json::from_value(row.required_capabilities).unwrap_or_default();

    Ok(Task {
        id,
        user_id: row.user_id,
        state: from_db_state(row.state),
        assigned_node_id,
        payload: TaskPayload {
            repo_url: row.repo_url,
            branch: row.branch,
            prompt: row.prompt,
            github_token: row.github_token,
            create_pr: row.create_pr,
            pr_title: row.pr_title,
            pr_body: row.pr_body,
            env_vars,
            max_iterations: row.max_iterations.max(0) as u32,
            completion_promise: row.completion_promise,
            required_capabilities,
        },
        created_at: row.created_at,
        started_at: row.started_at,
        completed_at: row.completed_at,
        error_message: row.error_message,
        pr_url: row.pr_url,
        usage: UsageCounters {
            input_tokens: row.input_tokens,
            output_tokens: row.output_tokens,
            compute_time_ms: row.compute_time_ms,
            tool_calls: row.tool_calls,
        },
        retry_count: row.retry_count.max(0) as u32,
    })
}

/// Write a transition through to the database using the existing
/// per-transition query functions, keeping the query layer's exact
/// CAS-by-update shape rather than a generic row replace.
async fn write_through(pool: &PgPool, old: &Task, new: &Task) -> anyhow::Result<()> {
    let id = new.id.to_string();
    match (old.state, new.state) {
        (TaskState::Queued, TaskState::Starting) => {
            let node_id = new
                .assigned_node_id
                .expect("Starting transition always assigns a node")
                .to_string();
            task_db::assign_to_node(pool, &id, &node_id).await?;
        }
        (TaskState::Starting, TaskState::Running) => {
            task_db::mark_running(pool, &id).await?;
        }
        (TaskState::Running, TaskState::Completed) => {
            task_db::mark_completed(pool, &id, new.pr_url.as_deref()).await?;
        }
        (_, TaskState::Failed) => {
            task_db::mark_failed(pool, &id, new.error_message.as_deref().unwrap_or("")).await?;
        }
        (_, TaskState::Cancelled) => {
            task_db::mark_cancelled(pool, &id).await?;
        }
        (TaskState::Starting, TaskState::Queued) | (TaskState::Running, TaskState::Queued) => {
            task_db::requeue(pool, &id, to_db_state(old.state)).await?;
            if new.retry_count != old.retry_count {
                task_db::increment_retry_count(pool, &id).await?;
            }
        }
        _ => {
            anyhow::bail!("no write-through path for transition {} -> {}", old.state, new.state);
        }
    }
    Ok(())
}

/// The task store: authoritative in-memory table keyed by `TaskId`, with
/// synchronous write-through to Postgres when a pool is configured.
pub struct TaskStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
    pool: Option<PgPool>,
    event_bus: Arc<EventBus>,
}

impl TaskStore {
    pub fn new(event_bus: Arc<EventBus>, pool: Option<PgPool>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            pool,
            event_bus,
        }
    }

    /// Insert a recovered task directly into the table without emitting an
    /// event or writing through (used only by the recovery loader, which
    /// has already read these rows from the database).
    pub(crate) fn insert_recovered(&self, task: Task) {
        self.tasks.lock().expect("task store lock poisoned").insert(task.id, task);
    }

    /// Submit a new task: mints a `TaskId`, inserts it `Queued`, persists it,
    /// and emits the initial `StateChange` event.
    pub async fn create(&self, user_id: Uuid, payload: TaskPayload) -> Result<Task> {
        let task = Task::new(TaskId::new(), user_id, payload);

        self.tasks
            .lock()
            .expect("task store lock poisoned")
            .insert(task.id, task.clone());

        if let Some(pool) = &self.pool {
            let row = task_to_row(&task);
            if let Err(e) = task_db::insert_task(pool, &row).await {
                self.tasks.lock().expect("task store lock poisoned").remove(&task.id);
                return Err(MarathonError::Internal(format!("failed to persist task: {e:#}")));
            }
        }

        self.event_bus.publish(
            task.id,
            TaskEventKind::StateChange,
            task.state.to_string().into_bytes(),
            Some(task.state),
        );

        Ok(task)
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.lock().expect("task store lock poisoned").get(&id).cloned()
    }

    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let tasks = self.tasks.lock().expect("task store lock poisoned");
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| filter.user_id.is_none_or(|u| u == t.user_id))
            .filter(|t| filter.state.is_none_or(|s| s == t.state))
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        out
    }

    /// Compare-and-set transition. `mutate` is applied after the state field
    /// itself and automatic timestamps are set, so callers can attach
    /// transition-specific fields (`assigned_node_id`, `error_message`,
    /// `pr_url`, `retry_count`) without this function needing a bespoke
    /// patch type per transition.
    pub async fn transition(
        &self,
        id: TaskId,
        from_states: &[TaskState],
        to: TaskState,
        mutate: impl FnOnce(&mut Task),
    ) -> Result<Task> {
        let (old, new) = {
            let mut tasks = self.tasks.lock().expect("task store lock poisoned");
            let task = tasks.get_mut(&id).ok_or_else(|| MarathonError::not_found_task(id))?;

            if !from_states.contains(&task.state) {
                return Err(MarathonError::StateConflict {
                    task_id: id,
                    current: task.state.to_string(),
                    attempted: to.to_string(),
                });
            }
            if task.state.is_terminal() {
                return Err(MarathonError::StateConflict {
                    task_id: id,
                    current: task.state.to_string(),
                    attempted: to.to_string(),
                });
            }

            let old = task.clone();
            task.state = to;
            if to == TaskState::Starting && task.started_at.is_none() {
                task.started_at = Some(Utc::now());
            }
            if to.is_terminal() {
                task.completed_at = Some(Utc::now());
            }
            if to.is_terminal() || to == TaskState::Queued {
                task.assigned_node_id = None;
            }
            mutate(task);
            let new = task.clone();
            (old, new)
        };

        if let Some(pool) = &self.pool {
            if let Err(e) = write_through(pool, &old, &new).await {
                // Roll back the optimistic in-memory transition.
                self.tasks.lock().expect("task store lock poisoned").insert(id, old);
                return Err(MarathonError::Internal(format!(
                    "failed to persist transition for task {id}: {e:#}"
                )));
            }
        }

        self.event_bus.publish(
            new.id,
            TaskEventKind::StateChange,
            new.state.to_string().into_bytes(),
            Some(new.state),
        );

        Ok(new)
    }

    /// Accumulate usage onto a task's rolling counters. Does not itself
    /// transition state or publish a `StateChange`; callers publish a
    /// `Usage` event separately (see the metering aggregator).
    pub fn accumulate_usage(&self, id: TaskId, delta: UsageCounters) -> Result<Task> {
        let mut tasks = self.tasks.lock().expect("task store lock poisoned");
        let task = tasks.get_mut(&id).ok_or_else(|| MarathonError::not_found_task(id))?;
        task.usage.accumulate(delta);
        Ok(task.clone())
    }

    /// Every task currently assigned to `node_id` and not yet terminal.
    /// Used by the scheduler when a node is swept dead.
    pub fn tasks_assigned_to(&self, node_id: NodeId) -> Vec<Task> {
        self.tasks
            .lock()
            .expect("task store lock poisoned")
            .values()
            .filter(|t| t.assigned_node_id == Some(node_id) && !t.state.is_terminal())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;

    fn store() -> TaskStore {
        TaskStore::new(Arc::new(EventBus::default()), None)
    }

    async fn submit(store: &TaskStore) -> Task {
        store
            .create(Uuid::new_v4(), TaskPayload::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_inserts_queued_task() {
        let store = store();
        let task = submit(&store).await;
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(store.get(task.id).unwrap().state, TaskState::Queued);
    }

    #[tokio::test]
    async fn transition_rejects_illegal_from_state() {
        let store = store();
        let task = submit(&store).await;
        let err = store
            .transition(task.id, &[TaskState::Running], TaskState::Completed, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, MarathonError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn transition_sets_started_at_once() {
        let store = store();
        let task = submit(&store).await;
        let node_id = NodeId::new();
        let started = store
            .transition(task.id, &[TaskState::Queued], TaskState::Starting, |t| {
                t.assigned_node_id = Some(node_id);
            })
            .await
            .unwrap();
        assert!(started.started_at.is_some());
        assert_eq!(started.assigned_node_id, Some(node_id));

        // Requeue (node lost) must not clear started_at, and re-dispatch must not reset it.
        let requeued = store
            .transition(task.id, &[TaskState::Starting], TaskState::Queued, |t| {
                t.retry_count += 1;
            })
            .await
            .unwrap();
        assert_eq!(requeued.started_at, started.started_at);
        assert!(requeued.assigned_node_id.is_none());
    }

    #[tokio::test]
    async fn assigned_node_id_survives_starting_to_running() {
        let store = store();
        let task = submit(&store).await;
        let node_id = NodeId::new();
        store
            .transition(task.id, &[TaskState::Queued], TaskState::Starting, |t| {
                t.assigned_node_id = Some(node_id);
            })
            .await
            .unwrap();
        let running = store.transition(task.id, &[TaskState::Starting], TaskState::Running, |_| {}).await.unwrap();
        assert_eq!(running.assigned_node_id, Some(node_id));
        assert_eq!(store.tasks_assigned_to(node_id).len(), 1);
    }

    #[tokio::test]
    async fn terminal_task_never_transitions_again() {
        let store = store();
        let task = submit(&store).await;
        store
            .transition(task.id, &[TaskState::Queued], TaskState::Cancelled, |_| {})
            .await
            .unwrap();
        let err = store
            .transition(task.id, &[TaskState::Cancelled], TaskState::Queued, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, MarathonError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn list_filters_by_user_and_state() {
        let store = store();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let t1 = store.create(user_a, TaskPayload::default()).await.unwrap();
        let _t2 = store.create(user_b, TaskPayload::default()).await.unwrap();
        store
            .transition(t1.id, &[TaskState::Queued], TaskState::Cancelled, |_| {})
            .await
            .unwrap();

        let for_a = store.list(&TaskFilter { user_id: Some(user_a), state: None });
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].user_id, user_a);

        let queued = store.list(&TaskFilter { user_id: None, state: Some(TaskState::Queued) });
        assert_eq!(queued.len(), 1);
    }

    #[tokio::test]
    async fn accumulate_usage_adds_deltas() {
        let store = store();
        let task = submit(&store).await;
        store
            .accumulate_usage(
                task.id,
                UsageCounters { input_tokens: 10, output_tokens: 5, compute_time_ms: 100, tool_calls: 1 },
            )
            .unwrap();
        store
            .accumulate_usage(
                task.id,
                UsageCounters { input_tokens: 3, output_tokens: 1, compute_time_ms: 50, tool_calls: 2 },
            )
            .unwrap();
        let task = store.get(task.id).unwrap();
        assert_eq!(task.usage.input_tokens, 13);
        assert_eq!(task.usage.tool_calls, 3);
    }

    #[tokio::test]
    async fn tasks_assigned_to_node_excludes_terminal() {
        let store = store();
        let task = submit(&store).await;
        let node_id = NodeId::new();
        store
            .transition(task.id, &[TaskState::Queued], TaskState::Starting, |t| {
                t.assigned_node_id = Some(node_id);
            })
            .await
            .unwrap();
        assert_eq!(store.tasks_assigned_to(node_id).len(), 1);

        store
            .transition(task.id, &[TaskState::Starting], TaskState::Cancelled, |_| {})
            .await
            .unwrap();
        assert_eq!(store.tasks_assigned_to(node_id).len(), 0);
    }
}
