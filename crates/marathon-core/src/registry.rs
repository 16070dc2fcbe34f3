//! The node registry: tracks worker liveness, capacity, and capability tags.
//!
//! A keyed table behind a handle, with a background liveness sweeper
//! instead of a static map. The registry never calls back into the
//! scheduler (see DESIGN.md's note on breaking the scheduler/registry
//! cycle): `sweep` only reports which nodes just died or were
//! garbage-collected, and the caller (the scheduler) decides what to do
//! about tasks that were assigned to them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::id::NodeId;
use crate::node::{Node, NodeInfo, NodeStatus};

/// Default liveness timeout: a node with no heartbeat in this window is
/// considered dead by the sweeper.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default sweeper tick interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// Default grace window a dead node is kept in the table (for status
/// visibility) before being garbage-collected.
pub const DEFAULT_GC_GRACE: Duration = Duration::from_secs(5 * 60);

/// Result of one liveness sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepResult {
    /// Nodes that transitioned Idle/Busy -> Dead on this sweep. The
    /// scheduler must re-queue every task assigned to these nodes.
    pub newly_dead: Vec<NodeId>,
    /// Nodes removed from the table entirely (dead past the grace window).
    pub garbage_collected: Vec<NodeId>,
}

pub struct NodeRegistry {
    nodes: Mutex<HashMap<NodeId, Node>>,
    heartbeat_timeout: Duration,
    gc_grace: Duration,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_GC_GRACE)
    }
}

impl NodeRegistry {
    pub fn new(heartbeat_timeout: Duration, gc_grace: Duration) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            heartbeat_timeout,
            gc_grace,
        }
    }

    /// Register a new worker node. Always succeeds; the node starts `Idle`
    /// with zero in-flight tasks.
    pub fn register(&self, info: NodeInfo) -> NodeId {
        let id = NodeId::new();
        let node = Node::new(id, info);
        info!(node_id = %id, address = %node.address, "node registered");
        self.nodes.lock().expect("registry lock poisoned").insert(id, node);
        id
    }

    /// Record a heartbeat, refreshing liveness and (optionally) the
    /// reported status. A heartbeat from a node the sweeper had marked
    /// `Dead` revives it, since it is now demonstrably alive again.
    pub fn heartbeat(&self, node_id: NodeId, status: Option<NodeStatus>) -> Option<()> {
        let mut nodes = self.nodes.lock().expect("registry lock poisoned");
        let node = nodes.get_mut(&node_id)?;
        node.last_heartbeat_at = Utc::now();
        if let Some(status) = status {
            node.status = status;
        } else if node.status == NodeStatus::Dead {
            node.status = NodeStatus::Idle;
        }
        Some(())
    }

    /// Remove a node immediately (graceful shutdown / drain complete).
    pub fn deregister(&self, node_id: NodeId) -> Option<Node> {
        let removed = self.nodes.lock().expect("registry lock poisoned").remove(&node_id);
        if removed.is_some() {
            info!(node_id = %node_id, "node deregistered");
        }
        removed
    }

    /// Snapshot of every node currently in the table, sorted by `NodeId` for
    /// a stable read.
    pub fn snapshot(&self) -> Vec<Node> {
        let nodes = self.nodes.lock().expect("registry lock poisoned");
        let mut out: Vec<Node> = nodes.values().cloned().collect();
        out.sort_by_key(|n| n.id);
        out
    }

    pub fn get(&self, node_id: NodeId) -> Option<Node> {
        self.nodes.lock().expect("registry lock poisoned").get(&node_id).cloned()
    }

    /// Select the best eligible node for a task requiring `required`
    /// capability tags: among nodes with spare capacity whose capabilities
    /// are a superset of `required`, prefer (1) fewer `in_flight`, (2)
    /// earliest `last_heartbeat_at`, (3) lexicographically smaller `NodeId`.
    pub fn pick_eligible(&self, required: &[String]) -> Option<NodeId> {
        let nodes = self.nodes.lock().expect("registry lock poisoned");
        nodes
            .values()
            .filter(|n| n.has_spare_capacity() && n.satisfies(required))
            .min_by(|a, b| {
                a.in_flight
                    .cmp(&b.in_flight)
                    .then_with(|| a.last_heartbeat_at.cmp(&b.last_heartbeat_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|n| n.id)
    }

    /// Increment a node's in-flight count and flip it to `Busy` once it
    /// reaches capacity. Returns `false` if the node is unknown or already
    /// at capacity (caller raced another dispatch).
    pub fn increment_in_flight(&self, node_id: NodeId) -> bool {
        let mut nodes = self.nodes.lock().expect("registry lock poisoned");
        let Some(node) = nodes.get_mut(&node_id) else {
            return false;
        };
        if node.in_flight >= node.capacity {
            return false;
        }
        node.in_flight += 1;
        node.status = if node.in_flight >= node.capacity {
            NodeStatus::Busy
        } else {
            NodeStatus::Idle
        };
        true
    }

    /// Decrement a node's in-flight count (task completed, requeued, or
    /// cancelled), flipping back to `Idle` if it had been `Busy`.
    pub fn decrement_in_flight(&self, node_id: NodeId) {
        let mut nodes = self.nodes.lock().expect("registry lock poisoned");
        if let Some(node) = nodes.get_mut(&node_id) {
            node.in_flight = node.in_flight.saturating_sub(1);
            if node.status == NodeStatus::Busy && node.in_flight < node.capacity {
                node.status = NodeStatus::Idle;
            }
        }
    }

    /// Mark a node suspect: a hint for the sweeper to re-check it sooner,
    /// set when a cancel acknowledgement times out (see DESIGN.md). Does
    /// not itself force the node to `Dead`.
    pub fn mark_suspect(&self, node_id: NodeId) {
        if let Some(node) = self.nodes.lock().expect("registry lock poisoned").get_mut(&node_id) {
            node.suspect = true;
            warn!(node_id = %node_id, "node marked suspect after cancel-ack timeout");
        }
    }

    /// Run one liveness sweep: mark overdue nodes `Dead`, and garbage
    /// collect nodes that have been `Dead` longer than the grace window.
    /// `suspect` nodes are swept against half the heartbeat timeout, since a
    /// suspect node's last good signal is less trustworthy.
    pub fn sweep(&self) -> SweepResult {
        let now = Utc::now();
        let mut result = SweepResult::default();
        let mut nodes = self.nodes.lock().expect("registry lock poisoned");

        let mut to_remove = Vec::new();
        for node in nodes.values_mut() {
            let timeout = if node.suspect {
                self.heartbeat_timeout / 2
            } else {
                self.heartbeat_timeout
            };
            let overdue = now.signed_duration_since(node.last_heartbeat_at)
                > chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());

            match node.status {
                NodeStatus::Idle | NodeStatus::Busy if overdue => {
                    node.status = NodeStatus::Dead;
                    node.in_flight = 0;
                    result.newly_dead.push(node.id);
                    warn!(node_id = %node.id, "node liveness timeout, marking dead");
                }
                NodeStatus::Dead => {
                    let dead_for = now.signed_duration_since(node.last_heartbeat_at);
                    if dead_for > chrono::Duration::from_std(self.gc_grace).unwrap_or(chrono::Duration::zero()) {
                        to_remove.push(node.id);
                    }
                }
                _ => {}
            }
        }

        for id in &to_remove {
            nodes.remove(id);
            result.garbage_collected.push(*id);
            info!(node_id = %id, "dead node garbage collected");
        }

        result
    }

    /// Spawn the periodic liveness sweeper. The scheduler passes the
    /// returned `SweepResult`s to its own requeue logic by draining a
    /// channel fed from this closure, rather than the registry calling
    /// back into the scheduler directly.
    pub fn spawn_sweeper(
        self: std::sync::Arc<Self>,
        interval: Duration,
        on_sweep: tokio::sync::mpsc::Sender<SweepResult>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let result = self.sweep();
                if !result.newly_dead.is_empty() || !result.garbage_collected.is_empty() {
                    let _ = on_sweep.send(result).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn info(caps: &[&str]) -> NodeInfo {
        NodeInfo {
            address: "127.0.0.1:9000".into(),
            capabilities: caps.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            capacity: 1,
        }
    }

    #[test]
    fn register_then_snapshot() {
        let registry = NodeRegistry::default();
        let id = registry.register(info(&["claude-code"]));
        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id, id);
        assert_eq!(snap[0].status, NodeStatus::Idle);
    }

    #[test]
    fn pick_eligible_requires_capability_superset() {
        let registry = NodeRegistry::default();
        registry.register(info(&["docker"]));
        assert!(registry.pick_eligible(&["claude-code".into()]).is_none());

        let id = registry.register(info(&["claude-code", "docker"]));
        assert_eq!(registry.pick_eligible(&["claude-code".into()]), Some(id));
    }

    #[test]
    fn pick_eligible_prefers_fewer_in_flight() {
        let registry = NodeRegistry::default();
        let busy = registry.register(info(&["claude-code"]));
        let a = registry.register(info(&["claude-code"]));
        registry.nodes.lock().unwrap().get_mut(&busy).unwrap().capacity = 5;
        registry.increment_in_flight(busy);

        let picked = registry.pick_eligible(&["claude-code".into()]).unwrap();
        assert_eq!(picked, a);
    }

    #[test]
    fn pick_eligible_breaks_ties_by_node_id() {
        let registry = NodeRegistry::default();
        let mut ids = vec![
            registry.register(info(&["claude-code"])),
            registry.register(info(&["claude-code"])),
        ];
        ids.sort();
        let picked = registry.pick_eligible(&["claude-code".into()]).unwrap();
        assert_eq!(picked, ids[0]);
    }

    #[test]
    fn increment_in_flight_flips_to_busy_at_capacity() {
        let registry = NodeRegistry::default();
        let id = registry.register(info(&[]));
        assert!(registry.increment_in_flight(id));
        let node = registry.get(id).unwrap();
        assert_eq!(node.in_flight, 1);
        assert_eq!(node.status, NodeStatus::Busy);
        assert!(!registry.increment_in_flight(id), "already at capacity");
    }

    #[test]
    fn decrement_in_flight_flips_back_to_idle() {
        let registry = NodeRegistry::default();
        let id = registry.register(info(&[]));
        registry.increment_in_flight(id);
        registry.decrement_in_flight(id);
        let node = registry.get(id).unwrap();
        assert_eq!(node.in_flight, 0);
        assert_eq!(node.status, NodeStatus::Idle);
    }

    #[test]
    fn sweep_marks_overdue_nodes_dead() {
        let registry = NodeRegistry::new(Duration::from_millis(1), DEFAULT_GC_GRACE);
        let id = registry.register(info(&[]));
        std::thread::sleep(Duration::from_millis(5));
        let result = registry.sweep();
        assert_eq!(result.newly_dead, vec![id]);
        assert_eq!(registry.get(id).unwrap().status, NodeStatus::Dead);
    }

    #[test]
    fn dead_node_is_not_eligible_for_dispatch() {
        let registry = NodeRegistry::new(Duration::from_millis(1), DEFAULT_GC_GRACE);
        registry.register(info(&["claude-code"]));
        std::thread::sleep(Duration::from_millis(5));
        registry.sweep();
        assert!(registry.pick_eligible(&["claude-code".into()]).is_none());
    }

    #[test]
    fn sweep_garbage_collects_after_grace_window() {
        let registry = NodeRegistry::new(Duration::from_millis(1), Duration::from_millis(5));
        let id = registry.register(info(&[]));
        std::thread::sleep(Duration::from_millis(3));
        registry.sweep(); // marks dead
        std::thread::sleep(Duration::from_millis(10));
        let result = registry.sweep(); // now past grace window
        assert_eq!(result.garbage_collected, vec![id]);
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn heartbeat_revives_a_dead_node() {
        let registry = NodeRegistry::new(Duration::from_millis(1), DEFAULT_GC_GRACE);
        let id = registry.register(info(&[]));
        std::thread::sleep(Duration::from_millis(5));
        registry.sweep();
        assert_eq!(registry.get(id).unwrap().status, NodeStatus::Dead);

        registry.heartbeat(id, None);
        assert_eq!(registry.get(id).unwrap().status, NodeStatus::Idle);
    }

    #[test]
    fn deregister_removes_node() {
        let registry = NodeRegistry::default();
        let id = registry.register(info(&[]));
        assert!(registry.deregister(id).is_some());
        assert!(registry.get(id).is_none());
    }
}
