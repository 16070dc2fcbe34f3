//! The error type shared by both external transports (the worker wire
//! protocol and the HTTP gateway) and by internal callers of the RPC façade.
//!
//! Library code at typed boundaries (this module, the façade, the task
//! store, the registry) returns `Result<_, MarathonError>`. Top-level glue
//! (orchestrator startup, migration running, config resolution, recovery
//! loading) uses `anyhow::Result` with `.context(...)` instead, since those
//! call sites want a chain of human-readable context rather than a typed
//! variant a caller might match on.

use crate::id::{NodeId, TaskId};

/// Every error kind a caller of the RPC façade can observe.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MarathonError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("state conflict: task {task_id} is {current}, cannot transition to {attempted}")]
    StateConflict {
        task_id: TaskId,
        current: String,
        attempted: String,
    },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("node lost: {0}")]
    NodeLost(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MarathonError {
    /// Stable machine-readable code, shared by the HTTP gateway's JSON
    /// error body and the worker protocol's `ErrorResponse`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::StateConflict { .. } => "state_conflict",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::DispatchFailed(_) => "dispatch_failed",
            Self::NodeLost(_) => "node_lost",
            Self::Internal(_) => "internal",
        }
    }

    /// Human-readable message, independent of `code()`.
    pub fn message(&self) -> String {
        self.to_string()
    }

    pub fn not_found_task(task_id: TaskId) -> Self {
        Self::NotFound(format!("task {task_id} not found"))
    }

    pub fn not_found_node(node_id: NodeId) -> Self {
        Self::NotFound(format!("node {node_id} not found"))
    }
}

/// Wire-level error payload, mirrored 1:1 onto the worker protocol's
/// `ErrorResponse{code, message}` and the HTTP gateway's JSON error body.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&MarathonError> for ErrorResponse {
    fn from(err: &MarathonError) -> Self {
        Self {
            code: err.code().to_owned(),
            message: err.message(),
        }
    }
}

impl From<MarathonError> for ErrorResponse {
    fn from(err: MarathonError) -> Self {
        ErrorResponse::from(&err)
    }
}

pub type Result<T> = std::result::Result<T, MarathonError>;
