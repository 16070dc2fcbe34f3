//! The dispatch loop: matches queued tasks to eligible nodes, tracks
//! dispatch/cancel acknowledgement timeouts, and requeues work off nodes the
//! registry reports dead.
//!
//! Built around `tokio::select!` over a wake channel and a
//! `CancellationToken`, with structured `tracing` at every transition. The
//! loop pairs a FIFO queue against the registry's eligible-node table, and
//! tracks per-task ack deadlines rather than holding a fixed concurrency
//! permit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{MarathonError, Result};
use crate::event::TaskEventKind;
use crate::event_bus::EventBus;
use crate::id::{NodeId, TaskId};
use crate::node::Node;
use crate::registry::{NodeRegistry, SweepResult};
use crate::task::{Task, TaskState};
use crate::task_store::TaskStore;

/// Tunables for the dispatch loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub dispatch_ack_timeout: Duration,
    pub cancel_ack_timeout: Duration,
    pub head_block_skip: Duration,
    pub max_retries: u32,
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_ack_timeout: Duration::from_secs(10),
            cancel_ack_timeout: Duration::from_secs(15),
            head_block_skip: Duration::from_millis(500),
            max_retries: 3,
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Hands a task payload to the node it was matched with, and forwards
/// cancellation requests to a node running a task. Implemented by the RPC
/// façade over whichever transport currently reaches that node (the
/// length-prefixed worker wire codec in production, an in-process stub in
/// tests).
#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    async fn dispatch_task(&self, node: &Node, task: &Task) -> Result<()>;
    async fn send_cancel(&self, node: &Node, task_id: TaskId) -> Result<()>;
}

struct PendingDispatch {
    node_id: NodeId,
    deadline: Instant,
}

struct PendingCancel {
    node_id: NodeId,
    deadline: Instant,
}

/// A lightweight handle for nudging the dispatch loop awake from any other
/// part of the system (submit, heartbeat-with-capacity, cancel-ack paths).
#[derive(Clone)]
pub struct SchedulerHandle {
    wake_tx: mpsc::Sender<()>,
}

impl SchedulerHandle {
    pub async fn wake(&self) {
        let _ = self.wake_tx.send(()).await;
    }

    pub fn wake_now(&self) {
        let _ = self.wake_tx.try_send(());
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    task_store: Arc<TaskStore>,
    registry: Arc<NodeRegistry>,
    event_bus: Arc<EventBus>,
    dispatcher: Arc<dyn WorkerDispatcher>,
    queue: Mutex<VecDeque<TaskId>>,
    head_blocked_since: Mutex<Option<(TaskId, Instant)>>,
    pending_dispatch: Mutex<HashMap<TaskId, PendingDispatch>>,
    pending_cancel: Mutex<HashMap<TaskId, PendingCancel>>,
    wake_tx: mpsc::Sender<()>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        task_store: Arc<TaskStore>,
        registry: Arc<NodeRegistry>,
        event_bus: Arc<EventBus>,
        dispatcher: Arc<dyn WorkerDispatcher>,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (wake_tx, wake_rx) = mpsc::channel(256);
        let scheduler = Arc::new(Self {
            config,
            task_store,
            registry,
            event_bus,
            dispatcher,
            queue: Mutex::new(VecDeque::new()),
            head_blocked_since: Mutex::new(None),
            pending_dispatch: Mutex::new(HashMap::new()),
            pending_cancel: Mutex::new(HashMap::new()),
            wake_tx,
        });
        (scheduler, wake_rx)
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle { wake_tx: self.wake_tx.clone() }
    }

    /// Push a newly-submitted (or recovered) task onto the back of the FIFO
    /// queue. Does not itself wake the loop; callers nudge the returned
    /// [`SchedulerHandle`] after enqueuing.
    pub fn enqueue(&self, task_id: TaskId) {
        self.queue.lock().expect("queue lock poisoned").push_back(task_id);
    }

    /// Rebuild the queue from a recovery snapshot, already ordered by
    /// original `created_at`.
    pub fn enqueue_recovered(&self, task_ids: impl IntoIterator<Item = TaskId>) {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        queue.extend(task_ids);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    /// Idempotent cancellation. Queued tasks are cancelled immediately;
    /// Starting/Running tasks get a cancel sent to their node and a
    /// `cancel_ack_timeout` deadline; terminal tasks are a no-op success.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn cancel(&self, task_id: TaskId) -> Result<Task> {
        let task = self.task_store.get(task_id).ok_or_else(|| MarathonError::not_found_task(task_id))?;

        match task.state {
            TaskState::Queued => {
                self.remove_from_queue(task_id);
                let cancelled = self
                    .task_store
                    .transition(task_id, &[TaskState::Queued], TaskState::Cancelled, |_| {})
                    .await?;
                info!(%task_id, "cancelled queued task");
                Ok(cancelled)
            }
            TaskState::Starting | TaskState::Running => {
                let Some(node_id) = task.assigned_node_id else {
                    return Err(MarathonError::Internal(format!(
                        "task {task_id} is {} with no assigned node",
                        task.state
                    )));
                };
                if let Some(node) = self.registry.get(node_id) {
                    if let Err(e) = self.dispatcher.send_cancel(&node, task_id).await {
                        warn!(%task_id, %node_id, error = %e, "failed to send cancel to node, will rely on timeout");
                    }
                }
                self.pending_cancel.lock().expect("pending_cancel lock poisoned").insert(
                    task_id,
                    PendingCancel { node_id, deadline: Instant::now() + self.config.cancel_ack_timeout },
                );
                info!(%task_id, %node_id, "cancel sent, awaiting acknowledgement");
                Ok(task)
            }
            _ => Ok(task),
        }
    }

    /// Called by the RPC façade when a node acknowledges a cancellation.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn ack_cancel(&self, task_id: TaskId) -> Result<()> {
        let Some(pending) = self.pending_cancel.lock().expect("pending_cancel lock poisoned").remove(&task_id) else {
            return Ok(());
        };
        self.finish_cancel(task_id, pending.node_id).await
    }

    async fn finish_cancel(&self, task_id: TaskId, node_id: NodeId) -> Result<()> {
        let result = self
            .task_store
            .transition(task_id, &[TaskState::Starting, TaskState::Running], TaskState::Cancelled, |_| {})
            .await;
        self.registry.decrement_in_flight(node_id);
        match result {
            Ok(_) => Ok(()),
            Err(MarathonError::StateConflict { .. }) => Ok(()), // already terminal, cancel is idempotent
            Err(e) => Err(e),
        }
    }

    /// Called by the RPC façade when the worker's first post-dispatch event
    /// arrives, confirming the task actually started.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn ack_dispatch(&self, task_id: TaskId) -> Result<()> {
        self.pending_dispatch.lock().expect("pending_dispatch lock poisoned").remove(&task_id);
        self.task_store
            .transition(task_id, &[TaskState::Starting], TaskState::Running, |_| {})
            .await?;
        Ok(())
    }

    fn remove_from_queue(&self, task_id: TaskId) {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        queue.retain(|id| *id != task_id);
    }

    /// One full dispatch attempt: drains the head of the queue while nodes
    /// are available, then applies head-of-line-blocking mitigation.
    async fn dispatch_pass(&self) {
        loop {
            let head_id = { self.queue.lock().expect("queue lock poisoned").front().copied() };
            let Some(head_id) = head_id else {
                *self.head_blocked_since.lock().expect("head_blocked lock poisoned") = None;
                return;
            };

            let Some(task) = self.task_store.get(head_id) else {
                self.queue.lock().expect("queue lock poisoned").pop_front();
                continue;
            };
            if task.state != TaskState::Queued {
                self.queue.lock().expect("queue lock poisoned").pop_front();
                continue;
            }

            if let Some(node_id) = self.registry.pick_eligible(&task.payload.required_capabilities) {
                self.queue.lock().expect("queue lock poisoned").pop_front();
                *self.head_blocked_since.lock().expect("head_blocked lock poisoned") = None;
                self.dispatch_to(task, node_id).await;
                continue;
            }

            // Head is blocked. Record when, and consider skipping ahead.
            let skip = {
                let mut guard = self.head_blocked_since.lock().expect("head_blocked lock poisoned");
                match *guard {
                    Some((id, since)) if id == head_id => since.elapsed() >= self.config.head_block_skip,
                    _ => {
                        *guard = Some((head_id, Instant::now()));
                        false
                    }
                }
            };

            if skip {
                self.try_dispatch_past_head().await;
            }
            return;
        }
    }

    /// Head-of-line-blocking mitigation: scan past the queue head for the
    /// first later task whose requirements are satisfiable right now, and
    /// dispatch it out of order.
    async fn try_dispatch_past_head(&self) {
        let candidate = {
            let queue = self.queue.lock().expect("queue lock poisoned");
            queue
                .iter()
                .skip(1)
                .copied()
                .find_map(|id| {
                    let task = self.task_store.get(id)?;
                    if task.state != TaskState::Queued {
                        return None;
                    }
                    let node_id = self.registry.pick_eligible(&task.payload.required_capabilities)?;
                    Some((id, node_id))
                })
        };

        let Some((task_id, node_id)) = candidate else { return };
        self.remove_from_queue(task_id);
        let Some(task) = self.task_store.get(task_id) else { return };
        info!(%task_id, %node_id, "dispatching past a blocked queue head");
        self.dispatch_to(task, node_id).await;
    }

    async fn dispatch_to(&self, task: Task, node_id: NodeId) {
        let task_id = task.id;
        if !self.registry.increment_in_flight(node_id) {
            // Lost the race (node hit capacity between pick_eligible and
            // here); put the task back at the head for the next pass.
            self.queue.lock().expect("queue lock poisoned").push_front(task_id);
            return;
        }

        let transitioned = self
            .task_store
            .transition(task_id, &[TaskState::Queued], TaskState::Starting, |t| {
                t.assigned_node_id = Some(node_id);
            })
            .await;

        let task = match transitioned {
            Ok(t) => t,
            Err(e) => {
                warn!(%task_id, error = %e, "failed to transition task to starting, releasing node slot");
                self.registry.decrement_in_flight(node_id);
                return;
            }
        };

        let Some(node) = self.registry.get(node_id) else {
            warn!(%task_id, %node_id, "node vanished immediately after dispatch decision");
            self.requeue_or_fail(task_id, MarathonError::DispatchFailed("node unavailable".into())).await;
            return;
        };

        match self.dispatcher.dispatch_task(&node, &task).await {
            Ok(()) => {
                self.pending_dispatch.lock().expect("pending_dispatch lock poisoned").insert(
                    task_id,
                    PendingDispatch { node_id, deadline: Instant::now() + self.config.dispatch_ack_timeout },
                );
                info!(%task_id, %node_id, "dispatched task");
            }
            Err(e) => {
                warn!(%task_id, %node_id, error = %e, "dispatch failed, requeueing");
                self.registry.decrement_in_flight(node_id);
                self.requeue_or_fail(task_id, e).await;
            }
        }
    }

    /// Requeue a task under retry budget, or fail it with the given error
    /// once the budget is exhausted.
    async fn requeue_or_fail(&self, task_id: TaskId, cause: MarathonError) {
        let Some(task) = self.task_store.get(task_id) else { return };
        if task.retry_count >= self.config.max_retries {
            let message = match &cause {
                MarathonError::NodeLost(_) => "worker heartbeat lost".to_owned(),
                other => other.message(),
            };
            let _ = self
                .task_store
                .transition(task_id, &[TaskState::Starting, TaskState::Running], TaskState::Failed, |t| {
                    t.error_message = Some(message);
                })
                .await;
            warn!(%task_id, "retry budget exhausted, task failed");
            return;
        }

        let from_states = [TaskState::Starting, TaskState::Running];
        if let Ok(task) = self
            .task_store
            .transition(task_id, &from_states, TaskState::Queued, |t| {
                t.retry_count += 1;
            })
            .await
        {
            let _ = task;
            self.queue.lock().expect("queue lock poisoned").push_back(task_id);
        }
    }

    /// Check outstanding dispatch-ack and cancel-ack deadlines, acting on
    /// any that have expired.
    async fn sweep_timeouts(&self) {
        let now = Instant::now();

        let expired_dispatch: Vec<TaskId> = {
            let pending = self.pending_dispatch.lock().expect("pending_dispatch lock poisoned");
            pending.iter().filter(|(_, p)| p.deadline <= now).map(|(id, _)| *id).collect()
        };
        for task_id in expired_dispatch {
            let node_id = {
                let mut pending = self.pending_dispatch.lock().expect("pending_dispatch lock poisoned");
                pending.remove(&task_id).map(|p| p.node_id)
            };
            if let Some(node_id) = node_id {
                warn!(%task_id, %node_id, "dispatch ack timed out");
                self.registry.decrement_in_flight(node_id);
                self.requeue_or_fail(task_id, MarathonError::DispatchFailed("ack timeout".into())).await;
            }
        }

        let expired_cancel: Vec<(TaskId, NodeId)> = {
            let pending = self.pending_cancel.lock().expect("pending_cancel lock poisoned");
            pending.iter().filter(|(_, p)| p.deadline <= now).map(|(id, p)| (*id, p.node_id)).collect()
        };
        for (task_id, node_id) in expired_cancel {
            self.pending_cancel.lock().expect("pending_cancel lock poisoned").remove(&task_id);
            warn!(%task_id, %node_id, "cancel ack timed out, cancelling anyway and marking node suspect");
            self.registry.mark_suspect(node_id);
            let _ = self.finish_cancel(task_id, node_id).await;
        }
    }

    /// React to a liveness sweep: every task assigned to a newly-dead node
    /// is requeued (or failed, past the retry budget).
    async fn handle_sweep(&self, result: SweepResult) {
        for node_id in result.newly_dead {
            let tasks = self.task_store.tasks_assigned_to(node_id);
            for task in tasks {
                self.pending_dispatch.lock().expect("pending_dispatch lock poisoned").remove(&task.id);
                self.pending_cancel.lock().expect("pending_cancel lock poisoned").remove(&task.id);
                self.requeue_or_fail(task.id, MarathonError::NodeLost(format!("node {node_id} heartbeat lost"))).await;
            }
        }
    }

    /// Run the dispatch loop until `cancel` is tripped. Drains in-flight
    /// dispatch/cancel bookkeeping is not performed here (that is an
    /// external-dispatcher concern); this loop simply stops attempting new
    /// dispatches once cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut wake_rx: mpsc::Receiver<()>,
        mut sweep_rx: mpsc::Receiver<SweepResult>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler loop shutting down");
                    return;
                }
                woken = wake_rx.recv() => {
                    if woken.is_none() {
                        return;
                    }
                }
                _ = ticker.tick() => {}
                Some(sweep) = sweep_rx.recv() => {
                    self.handle_sweep(sweep).await;
                }
            }

            self.sweep_timeouts().await;
            self.dispatch_pass().await;
        }
    }
}
