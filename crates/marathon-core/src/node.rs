//! The `Node` (worker) data model.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::NodeId;

/// Liveness status of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
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

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid node status: {0:?}")]
pub struct NodeStatusParseError(pub String);

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

/// Info a worker provides at `RegisterNode` time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub address: String,
    pub capabilities: BTreeSet<String>,
    pub capacity: u32,
}

/// A registered worker node, as held by the node registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    pub capabilities: BTreeSet<String>,
    pub capacity: u32,
    pub in_flight: u32,
    pub status: NodeStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Set when a cancel-ack timeout fires without a node acknowledgement;
    /// a hint to the liveness sweeper to heartbeat-check this node sooner,
    /// without itself forcing it to `Dead` (see DESIGN.md's open-question
    /// decision on cancel-ack timeout).
    pub suspect: bool,
}

impl Node {
    pub fn new(id: NodeId, info: NodeInfo) -> Self {
        let now = Utc::now();
        Self {
            id,
            address: info.address,
            capabilities: info.capabilities,
            capacity: info.capacity.max(1),
            in_flight: 0,
            status: NodeStatus::Idle,
            last_heartbeat_at: now,
            registered_at: now,
            suspect: false,
        }
    }

    /// Whether this node can currently accept one more task.
    pub fn has_spare_capacity(&self) -> bool {
        matches!(self.status, NodeStatus::Idle | NodeStatus::Busy) && self.in_flight < self.capacity
    }

    /// Whether `self.capabilities` is a superset of `required`.
    pub fn satisfies(&self, required: &[String]) -> bool {
        required.iter().all(|tag| self.capabilities.contains(tag))
    }
}
