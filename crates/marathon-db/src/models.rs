use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a task, mirrored from `marathon_core::task_store::TaskState`.
///
/// Stored as `text` rather than a native Postgres enum so that adding a
/// variant never requires an `ALTER TYPE` migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
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

/// Error returned when parsing an invalid [`TaskState`] string.
#[derive(Debug, Clone)]
pub struct TaskStateParseError(pub String);

impl fmt::Display for TaskStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task state: {:?}", self.0)
    }
}

impl std::error::Error for TaskStateParseError {}

// ---------------------------------------------------------------------------

/// Liveness status of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Idle,
    Busy,
    Draining,
    Dead,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Draining => "draining",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeStatus {
    type Err = NodeStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "draining" => Ok(Self::Draining),
            "dead" => Ok(Self::Dead),
            other => Err(NodeStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeStatus`] string.
#[derive(Debug, Clone)]
pub struct NodeStatusParseError(pub String);

impl fmt::Display for NodeStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node status: {:?}", self.0)
    }
}

impl std::error::Error for NodeStatusParseError {}

// ---------------------------------------------------------------------------

/// Scope of a [`UsageRecordRow`]: whether it tracks one task or one user's
/// running total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UsageScope {
    Task,
    User,
}

impl fmt::Display for UsageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Task => "task",
            Self::User => "user",
        };
        f.write_str(s)
    }
}

impl FromStr for UsageScope {
    type Err = UsageScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "user" => Ok(Self::User),
            other => Err(UsageScopeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`UsageScope`] string.
#[derive(Debug, Clone)]
pub struct UsageScopeParseError(pub String);

impl fmt::Display for UsageScopeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid usage scope: {:?}", self.0)
    }
}

impl std::error::Error for UsageScopeParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task row. `id` and `assigned_node_id` are the lowercase 32-hex-char
/// rendering of the core crate's `TaskId`/`NodeId` newtypes -- this crate
/// has no dependency on `marathon-core`, so IDs cross the boundary as text.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRow {
    pub id: String,
    pub state: TaskState,
    pub assigned_node_id: Option<String>,
    pub user_id: Uuid,
    pub repo_url: String,
    pub branch: String,
    pub prompt: String,
    pub github_token: Option<String>,
    pub create_pr: bool,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub env_vars: serde_json::Value,
    pub max_iterations: i32,
    pub completion_promise: Option<String>,
    pub required_capabilities: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub pr_url: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub compute_time_ms: i64,
    pub tool_calls: i64,
    pub retry_count: i32,
}

/// A worker node row. Persisted for audit/history only: the recovery loader
/// never repopulates the in-memory node registry from this table, since no
/// node survives an orchestrator restart without re-registering.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NodeRow {
    pub id: String,
    pub address: String,
    pub capabilities: serde_json::Value,
    pub capacity: i32,
    pub in_flight: i32,
    pub status: NodeStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// A rolling usage total, keyed by `(scope, subject)`. `subject` is a task's
/// hex ID when `scope = task`, or a user's UUID string when `scope = user`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageRecordRow {
    pub id: i64,
    pub scope: UsageScope,
    pub subject: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub compute_time_ms: i64,
    pub tool_calls: i64,
    pub updated_at: DateTime<Utc>,
}

/// An account record backing the HTTP gateway's auth endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub api_key_hash: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
