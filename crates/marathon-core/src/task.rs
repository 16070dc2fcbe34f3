//! The `Task` data model: submission payload, lifecycle state, and outcome.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::{NodeId, TaskId};

/// Lifecycle state of a task. Canonical definition; `marathon_db::models::TaskState`
/// is a text-column mirror of this enum, converted at the task store's
/// write-through boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Unspecified,
    Queued,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Every state this one may legally transition to.
    pub fn allowed_next(self) -> &'static [TaskState] {
        match self {
            Self::Unspecified => &[Self::Queued],
            Self::Queued => &[Self::Starting, Self::Cancelled],
            Self::Starting => &[Self::Running, Self::Queued, Self::Cancelled, Self::Failed],
            Self::Running => &[Self::Completed, Self::Failed, Self::Queued, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, to: TaskState) -> bool {
        self.allowed_next().contains(&to)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unspecified => "unspecified",
            Self::Queued => "queued",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid task state: {0:?}")]
pub struct TaskStateParseError(pub String);

impl FromStr for TaskState {
    type Err = TaskStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unspecified" => Ok(Self::Unspecified),
            "queued" => Ok(Self::Queued),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStateParseError(other.to_owned())),
        }
    }
}

/// One `-e KEY=VALUE` environment variable forwarded to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// Capability tags a task requires of the node it runs on (e.g. `claude-code`,
/// `docker`). Matched against a node's `capabilities` set by
/// [`crate::registry::NodeRegistry::pick_eligible`].
pub type Requirements = Vec<String>;

/// The submission payload: everything a client provides in `SubmitTask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub repo_url: String,
    pub branch: String,
    pub prompt: String,
    pub github_token: Option<String>,
    pub create_pr: bool,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub env_vars: Vec<EnvVar>,
    pub max_iterations: u32,
    /// Forwarded opaquely to the worker; the orchestrator never parses it.
    pub completion_promise: Option<String>,
    pub required_capabilities: Requirements,
}

impl Default for TaskPayload {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            branch: "main".to_owned(),
            prompt: String::new(),
            github_token: None,
            create_pr: false,
            pr_title: None,
            pr_body: None,
            env_vars: Vec::new(),
            max_iterations: 50,
            completion_promise: None,
            required_capabilities: Vec::new(),
        }
    }
}

/// Rolling usage counters, shared shape between a task's own totals and the
/// metering aggregator's per-task/per-user accumulators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub compute_time_ms: i64,
    pub tool_calls: i64,
}

impl UsageCounters {
    pub fn accumulate(&mut self, delta: UsageCounters) {
        self.input_tokens += delta.input_tokens;
        self.output_tokens += delta.output_tokens;
        self.compute_time_ms += delta.compute_time_ms;
        self.tool_calls += delta.tool_calls;
    }
}

/// A task record, as held by the task store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub user_id: Uuid,
    pub state: TaskState,
    pub assigned_node_id: Option<NodeId>,
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub pr_url: Option<String>,
    pub usage: UsageCounters,
    pub retry_count: u32,
}

impl Task {
    pub fn new(id: TaskId, user_id: Uuid, payload: TaskPayload) -> Self {
        Self {
            id,
            user_id,
            state: TaskState::Queued,
            assigned_node_id: None,
            payload,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            pr_url: None,
            usage: UsageCounters::default(),
            retry_count: 0,
        }
    }
}

/// Filter applied by `TaskStore::list`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub user_id: Option<Uuid>,
    pub state: Option<TaskState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_allowed_next() {
        for s in [TaskState::Completed, TaskState::Failed, TaskState::Cancelled] {
            assert!(s.allowed_next().is_empty());
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn non_terminal_states_are_not_terminal() {
        for s in [TaskState::Unspecified, TaskState::Queued, TaskState::Starting, TaskState::Running] {
            assert!(!s.is_terminal());
        }
    }

    #[test]
    fn state_display_roundtrip() {
        for s in [
            TaskState::Unspecified,
            TaskState::Queued,
            TaskState::Starting,
            TaskState::Running,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Cancelled,
        ] {
            let parsed: TaskState = s.to_string().parse().unwrap();
            assert_eq!(s, parsed);
        }
    }

    #[test]
    fn queued_to_starting_is_allowed() {
        assert!(TaskState::Queued.can_transition_to(TaskState::Starting));
    }

    #[test]
    fn queued_to_running_is_not_allowed() {
        assert!(!TaskState::Queued.can_transition_to(TaskState::Running));
    }

    #[test]
    fn starting_can_requeue() {
        assert!(TaskState::Starting.can_transition_to(TaskState::Queued));
    }
}
