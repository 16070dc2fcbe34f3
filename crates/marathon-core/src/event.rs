//! The `TaskEvent` data model published on the per-task event bus topic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::TaskId;
use crate::task::TaskState;

/// The kind of a [`TaskEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    StateChange,
    Log,
    Usage,
    Progress,
}

/// One event on a task's ordered stream. `sequence` is gap-free and
/// strictly increasing per task, assigned by the event bus at publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub sequence: u64,
    pub kind: TaskEventKind,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
    pub state: Option<TaskState>,
}

impl TaskEvent {
    pub fn state_change(task_id: TaskId, sequence: u64, state: TaskState) -> Self {
        Self {
            task_id,
            sequence,
            kind: TaskEventKind::StateChange,
            timestamp: Utc::now(),
            data: state.to_string().into_bytes(),
            state: Some(state),
        }
    }

    pub fn log(task_id: TaskId, sequence: u64, message: impl Into<String>) -> Self {
        Self {
            task_id,
            sequence,
            kind: TaskEventKind::Log,
            timestamp: Utc::now(),
            data: message.into().into_bytes(),
            state: None,
        }
    }

    pub fn usage(task_id: TaskId, sequence: u64, payload: &crate::task::UsageCounters) -> Self {
        let data = serde_json::to_vec(payload).unwrap_or_default();
        Self {
            task_id,
            sequence,
            kind: TaskEventKind::Usage,
            timestamp: Utc::now(),
            data,
            state: None,
        }
    }

    pub fn progress(task_id: TaskId, sequence: u64, message: impl Into<String>) -> Self {
        Self {
            task_id,
            sequence,
            kind: TaskEventKind::Progress,
            timestamp: Utc::now(),
            data: message.into().into_bytes(),
            state: None,
        }
    }
}

/// A delivered event, possibly preceded by a gap marker when the
/// subscription lagged and the bus dropped events under backpressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Delivery {
    /// Normal in-order delivery.
    Event(TaskEvent),
    /// Sequences `[from, to]` (inclusive) were dropped for a lagging
    /// subscriber before this delivery.
    Gap { from: u64, to: u64 },
    /// The subscriber asked to resume from a sequence this topic's history
    /// cannot satisfy -- the event bus was rebuilt from scratch by an
    /// orchestrator restart and resumed numbering at 0. Sent once, before
    /// any replay, so the subscriber knows to treat what follows as a new
    /// sequence origin rather than a continuation of the one it remembers.
    Recovered,
}
