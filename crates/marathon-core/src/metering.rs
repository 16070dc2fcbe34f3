//! Per-task and per-user usage accumulation.
//!
//! Mirrors the delta-additive shape of `usage::accumulate`'s
//! `INSERT ... ON CONFLICT DO UPDATE SET x = x + delta` in memory, registering
//! against the event bus's [`crate::event_bus::EventBus::set_global_tap`]
//! unbounded channel rather than a bounded per-client
//! [`crate::event_bus::Subscription`], since usage accounting must never
//! silently drop an event.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use marathon_db::models::UsageScope;
use marathon_db::queries::usage as usage_db;

use crate::error::{MarathonError, Result};
use crate::event::{TaskEvent, TaskEventKind};
use crate::event_bus::EventBus;
use crate::id::TaskId;
use crate::task::{TaskState, UsageCounters};
use crate::task_store::TaskStore;

pub struct MeteringAggregator {
    task_totals: Mutex<HashMap<TaskId, UsageCounters>>,
    user_totals: Mutex<HashMap<Uuid, UsageCounters>>,
    task_store: Arc<TaskStore>,
    pool: Option<PgPool>,
}

impl MeteringAggregator {
    pub fn new(task_store: Arc<TaskStore>, pool: Option<PgPool>) -> Arc<Self> {
        Arc::new(Self {
            task_totals: Mutex::new(HashMap::new()),
            user_totals: Mutex::new(HashMap::new()),
            task_store,
            pool,
        })
    }

    /// Rehydrate `task_totals`/`user_totals` from the persisted
    /// `usage_records` ledger. Called once on startup, before the aggregator
    /// starts accepting live `Usage` events, so `get_usage` never reports
    /// zero for a user with prior history just because this process is new.
    pub async fn load(&self) -> Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };

        let task_rows = usage_db::list_by_scope(pool, UsageScope::Task)
            .await
            .map_err(|e| MarathonError::Internal(format!("failed to load task usage records: {e:#}")))?;
        let mut task_totals = self.task_totals.lock().expect("task_totals lock poisoned");
        for row in &task_rows {
            let Ok(task_id) = TaskId::from_str(&row.subject) else {
                warn!(subject = %row.subject, "skipping task usage record with unparseable subject");
                continue;
            };
            task_totals.insert(
                task_id,
                UsageCounters {
                    input_tokens: row.input_tokens,
                    output_tokens: row.output_tokens,
                    compute_time_ms: row.compute_time_ms,
                    tool_calls: row.tool_calls,
                },
            );
        }
        drop(task_totals);

        let user_rows = usage_db::list_by_scope(pool, UsageScope::User)
            .await
            .map_err(|e| MarathonError::Internal(format!("failed to load user usage records: {e:#}")))?;
        let mut user_totals = self.user_totals.lock().expect("user_totals lock poisoned");
        for row in &user_rows {
            let Ok(user_id) = Uuid::parse_str(&row.subject) else {
                warn!(subject = %row.subject, "skipping user usage record with unparseable subject");
                continue;
            };
            user_totals.insert(
                user_id,
                UsageCounters {
                    input_tokens: row.input_tokens,
                    output_tokens: row.output_tokens,
                    compute_time_ms: row.compute_time_ms,
                    tool_calls: row.tool_calls,
                },
            );
        }
        drop(user_totals);

        info!(tasks = task_rows.len(), users = user_rows.len(), "recovered usage aggregates from storage");
        Ok(())
    }

    /// Install this aggregator as the event bus's global tap and spawn the
    /// task that drains it. Returns the join handle so callers can await it
    /// on shutdown.
    pub fn spawn(self: Arc<Self>, event_bus: &EventBus) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        event_bus.set_global_tap(tx);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.handle_event(event).await;
            }
        })
    }

    async fn handle_event(&self, event: TaskEvent) {
        match event.kind {
            TaskEventKind::Usage => {
                let Ok(delta) = serde_json::from_slice::<UsageCounters>(&event.data) else {
                    warn!(task_id = %event.task_id, "malformed usage event payload, dropping");
                    return;
                };
                self.accumulate(event.task_id, delta);
            }
            TaskEventKind::StateChange => {
                if event.state.is_some_and(TaskState::is_terminal) {
                    self.flush(event.task_id).await;
                }
            }
            _ => {}
        }
    }

    fn accumulate(&self, task_id: TaskId, delta: UsageCounters) {
        self.task_totals
            .lock()
            .expect("task_totals lock poisoned")
            .entry(task_id)
            .or_default()
            .accumulate(delta);

        if let Some(task) = self.task_store.get(task_id) {
            self.user_totals
                .lock()
                .expect("user_totals lock poisoned")
                .entry(task.user_id)
                .or_default()
                .accumulate(delta);
        }
    }

    /// Lock-free-to-callers snapshot of a task's rolling totals.
    pub fn task_usage(&self, task_id: TaskId) -> UsageCounters {
        self.task_totals
            .lock()
            .expect("task_totals lock poisoned")
            .get(&task_id)
            .copied()
            .unwrap_or_default()
    }

    /// Snapshot of a user's rolling totals across every task this process
    /// has observed usage events for.
    pub fn user_usage(&self, user_id: Uuid) -> UsageCounters {
        self.user_totals
            .lock()
            .expect("user_totals lock poisoned")
            .get(&user_id)
            .copied()
            .unwrap_or_default()
    }

    /// Persist a task's final totals once it reaches a terminal state. A
    /// task's own total is frozen after this point, so the value flushed
    /// here is also the correct one-time delta to add to the owning user's
    /// persisted running total.
    async fn flush(&self, task_id: TaskId) {
        let Some(pool) = &self.pool else { return };

        let total = self.task_totals.lock().expect("task_totals lock poisoned").get(&task_id).copied();
        let Some(total) = total else { return };

        if let Err(e) = usage_db::accumulate(
            pool,
            UsageScope::Task,
            &task_id.to_string(),
            total.input_tokens,
            total.output_tokens,
            total.compute_time_ms,
            total.tool_calls,
        )
        .await
        {
            warn!(%task_id, error = %e, "failed to persist task usage record");
        }

        let Some(task) = self.task_store.get(task_id) else { return };
        if let Err(e) = usage_db::accumulate(
            pool,
            UsageScope::User,
            &task.user_id.to_string(),
            total.input_tokens,
            total.output_tokens,
            total.compute_time_ms,
            total.tool_calls,
        )
        .await
        {
            warn!(user_id = %task.user_id, error = %e, "failed to persist user usage record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPayload;

    async fn harness() -> (Arc<MeteringAggregator>, Arc<EventBus>, Arc<TaskStore>) {
        let event_bus = Arc::new(EventBus::default());
        let task_store = Arc::new(TaskStore::new(Arc::clone(&event_bus), None));
        let aggregator = MeteringAggregator::new(Arc::clone(&task_store), None);
        Arc::clone(&aggregator).spawn(&event_bus);
        (aggregator, event_bus, task_store)
    }

    #[tokio::test]
    async fn accumulates_usage_events_per_task() {
        let (aggregator, event_bus, task_store) = harness().await;
        let task = task_store.create(Uuid::new_v4(), TaskPayload::default()).await.unwrap();

        let delta = UsageCounters { input_tokens: 10, output_tokens: 2, compute_time_ms: 5, tool_calls: 1 };
        event_bus.publish(task.id, TaskEventKind::Usage, serde_json::to_vec(&delta).unwrap(), None);
        event_bus.publish(task.id, TaskEventKind::Usage, serde_json::to_vec(&delta).unwrap(), None);

        // The tap is drained asynchronously; give the aggregator a tick.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let totals = aggregator.task_usage(task.id);
        assert_eq!(totals.input_tokens, 20);
        assert_eq!(totals.tool_calls, 2);
    }

    #[tokio::test]
    async fn accumulates_usage_per_user_across_tasks() {
        let (aggregator, event_bus, task_store) = harness().await;
        let user_id = Uuid::new_v4();
        let t1 = task_store.create(user_id, TaskPayload::default()).await.unwrap();
        let t2 = task_store.create(user_id, TaskPayload::default()).await.unwrap();

        let delta = UsageCounters { input_tokens: 5, output_tokens: 1, compute_time_ms: 1, tool_calls: 1 };
        event_bus.publish(t1.id, TaskEventKind::Usage, serde_json::to_vec(&delta).unwrap(), None);
        event_bus.publish(t2.id, TaskEventKind::Usage, serde_json::to_vec(&delta).unwrap(), None);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let totals = aggregator.user_usage(user_id);
        assert_eq!(totals.input_tokens, 10);
    }

    #[tokio::test]
    async fn unknown_task_usage_snapshot_is_zero() {
        let (aggregator, _event_bus, _task_store) = harness().await;
        let totals = aggregator.task_usage(TaskId::new());
        assert_eq!(totals, UsageCounters::default());
    }
}
