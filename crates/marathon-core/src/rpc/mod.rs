//! The RPC façade: transport-agnostic request/response handling shared by
//! the worker wire protocol and the HTTP gateway.
//!
//! A single context object wired to every subsystem (task store, registry,
//! scheduler, event bus), called from whichever transport is live. The
//! façade itself never knows whether a given request crossed a TCP frame or
//! an HTTP body. Every request carries a [`Caller`]
//! established by [`auth::ClientAuth`] (client bearer tokens) or
//! [`auth::NodeAuth`] (worker shared key) before it reaches a façade method.

pub mod auth;
pub mod wire;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MarathonError, Result};
use crate::event_bus::{EventBus, Subscription};
use crate::id::{NodeId, TaskId};
use crate::metering::MeteringAggregator;
use crate::node::{Node, NodeInfo, NodeStatus};
use crate::registry::NodeRegistry;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::task::{Task, TaskFilter, TaskPayload, UsageCounters};
use crate::task_store::TaskStore;

use auth::{ClientAuth, NodeAuth};

/// The authenticated identity behind an inbound request: a client acting as
/// a specific user, or a worker acting with no finer-grained identity than
/// "a node that knows the shared key."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Client(Uuid),
    Worker,
}

impl Caller {
    fn user_id(self) -> Result<Uuid> {
        match self {
            Caller::Client(user_id) => Ok(user_id),
            Caller::Worker => Err(MarathonError::PermissionDenied("worker callers cannot act as a client".into())),
        }
    }

    fn require_worker(self) -> Result<()> {
        match self {
            Caller::Worker => Ok(()),
            Caller::Client(_) => Err(MarathonError::PermissionDenied("client callers cannot act as a worker".into())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub payload: TaskPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTaskRequest {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListTasksRequest {
    pub state: Option<crate::task::TaskState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTaskRequest {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub info: NodeInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: NodeId,
    pub status: Option<NodeStatus>,
}

/// What a worker reports back about a dispatched task, over `ReportEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerSignal {
    Started,
    Progress { message: String },
    Log { message: String },
    Completed { pr_url: Option<String> },
    Failed { error_message: String },
    CancelAck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEventRequest {
    pub task_id: TaskId,
    pub signal: WorkerSignal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportUsageRequest {
    pub task_id: TaskId,
    pub usage: UsageCounters,
}

/// The RPC façade: one instance per running orchestrator, shared behind an
/// `Arc` by both the worker listener and the HTTP gateway.
pub struct RpcFacade {
    task_store: Arc<TaskStore>,
    registry: Arc<NodeRegistry>,
    event_bus: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    scheduler_handle: SchedulerHandle,
    metering: Arc<MeteringAggregator>,
    client_auth: ClientAuth,
    node_auth: NodeAuth,
}

impl RpcFacade {
    pub fn new(
        task_store: Arc<TaskStore>,
        registry: Arc<NodeRegistry>,
        event_bus: Arc<EventBus>,
        scheduler: Arc<Scheduler>,
        metering: Arc<MeteringAggregator>,
        client_auth: ClientAuth,
        node_auth: NodeAuth,
    ) -> Self {
        let scheduler_handle = scheduler.handle();
        Self {
            task_store,
            registry,
            event_bus,
            scheduler,
            scheduler_handle,
            metering,
            client_auth,
            node_auth,
        }
    }

    /// Authenticate a client bearer token (the HTTP gateway's `Authorization:
    /// Bearer <token>` header).
    pub fn authenticate_client(&self, bearer_token: &str) -> Result<Caller> {
        self.client_auth.verify_token(bearer_token).map(Caller::Client)
    }

    /// Issue a fresh bearer token for an already-authenticated user id, used
    /// by the HTTP gateway's `/auth/register` and `/auth/login` handlers
    /// after they verify credentials against the `users` table.
    pub fn issue_client_token(&self, user_id: Uuid) -> String {
        self.client_auth.issue_token(user_id)
    }

    /// Authenticate a worker's shared key (the wire protocol's
    /// `RegisterNode`/`Heartbeat`/`ReportEvent`/`ReportUsage` frames).
    pub fn authenticate_node(&self, auth_key_hex: &str) -> Result<Caller> {
        self.node_auth.verify(auth_key_hex)?;
        Ok(Caller::Worker)
    }

    fn owned_task(&self, caller: Caller, task_id: TaskId) -> Result<Task> {
        let user_id = caller.user_id()?;
        let task = self.task_store.get(task_id).ok_or_else(|| MarathonError::not_found_task(task_id))?;
        if task.user_id != user_id {
            return Err(MarathonError::PermissionDenied(format!("task {task_id} is not owned by this caller")));
        }
        Ok(task)
    }

    // -- Client-facing operations --------------------------------------

    pub async fn submit_task(&self, caller: Caller, req: SubmitTaskRequest) -> Result<Task> {
        let user_id = caller.user_id()?;
        let task = self.task_store.create(user_id, req.payload).await?;
        self.scheduler.enqueue(task.id);
        self.scheduler_handle.wake_now();
        Ok(task)
    }

    pub async fn get_task(&self, caller: Caller, req: GetTaskRequest) -> Result<Task> {
        self.owned_task(caller, req.task_id)
    }

    pub async fn list_tasks(&self, caller: Caller, req: ListTasksRequest) -> Result<Vec<Task>> {
        let user_id = caller.user_id()?;
        let filter = TaskFilter { user_id: Some(user_id), state: req.state };
        Ok(self.task_store.list(&filter))
    }

    pub async fn cancel_task(&self, caller: Caller, req: CancelTaskRequest) -> Result<Task> {
        self.owned_task(caller, req.task_id)?;
        self.scheduler.cancel(req.task_id).await
    }

    pub async fn get_usage(&self, caller: Caller) -> Result<UsageCounters> {
        let user_id = caller.user_id()?;
        Ok(self.metering.user_usage(user_id))
    }

    /// Open a live event subscription for a task the caller owns, replaying
    /// from `from_sequence`.
    pub fn subscribe_task_events(&self, caller: Caller, task_id: TaskId, from_sequence: u64) -> Result<Subscription> {
        self.owned_task(caller, task_id)?;
        Ok(self.event_bus.subscribe(task_id, from_sequence))
    }

    // -- Worker-facing operations ----------------------------------------

    pub async fn register_node(&self, caller: Caller, req: RegisterNodeRequest) -> Result<NodeId> {
        caller.require_worker()?;
        let node_id = self.registry.register(req.info);
        self.scheduler_handle.wake_now();
        Ok(node_id)
    }

    pub async fn heartbeat(&self, caller: Caller, req: HeartbeatRequest) -> Result<()> {
        caller.require_worker()?;
        self.registry
            .heartbeat(req.node_id, req.status)
            .ok_or_else(|| MarathonError::not_found_node(req.node_id))?;
        if req.status.is_some_and(|s| matches!(s, NodeStatus::Idle)) {
            self.scheduler_handle.wake_now();
        }
        Ok(())
    }

    pub async fn report_event(&self, caller: Caller, req: ReportEventRequest) -> Result<()> {
        caller.require_worker()?;
        match req.signal {
            WorkerSignal::Started => {
                self.scheduler.ack_dispatch(req.task_id).await?;
            }
            WorkerSignal::Progress { message } => {
                self.event_bus.publish(
                    req.task_id,
                    crate::event::TaskEventKind::Progress,
                    message.into_bytes(),
                    None,
                );
            }
            WorkerSignal::Log { message } => {
                self.event_bus.publish(req.task_id, crate::event::TaskEventKind::Log, message.into_bytes(), None);
            }
            WorkerSignal::Completed { pr_url } => {
                self.finish_task(req.task_id, crate::task::TaskState::Completed, move |t| t.pr_url = pr_url).await?;
            }
            WorkerSignal::Failed { error_message } => {
                self.finish_task(req.task_id, crate::task::TaskState::Failed, move |t| {
                    t.error_message = Some(error_message)
                })
                .await?;
            }
            WorkerSignal::CancelAck => {
                self.scheduler.ack_cancel(req.task_id).await?;
            }
        }
        Ok(())
    }

    /// Transition a Running task to a terminal state reported directly by
    /// its worker (as opposed to scheduler-driven retry/cancel paths), and
    /// release the node slot it had been occupying.
    async fn finish_task(
        &self,
        task_id: TaskId,
        to: crate::task::TaskState,
        mutate: impl FnOnce(&mut Task) + Send,
    ) -> Result<()> {
        let node_id = self.task_store.get(task_id).and_then(|t| t.assigned_node_id);
        self.task_store
            .transition(task_id, &[crate::task::TaskState::Starting, crate::task::TaskState::Running], to, mutate)
            .await?;
        if let Some(node_id) = node_id {
            self.registry.decrement_in_flight(node_id);
        }
        self.scheduler_handle.wake_now();
        Ok(())
    }

    pub async fn report_usage(&self, caller: Caller, req: ReportUsageRequest) -> Result<()> {
        caller.require_worker()?;
        self.task_store.accumulate_usage(req.task_id, req.usage)?;
        self.event_bus.publish(
            req.task_id,
            crate::event::TaskEventKind::Usage,
            serde_json::to_vec(&req.usage).unwrap_or_default(),
            None,
        );
        Ok(())
    }

    pub fn node_by_id(&self, node_id: NodeId) -> Option<Node> {
        self.registry.get(node_id)
    }

    /// Remove a node whose wire connection has dropped. Any task it was
    /// running is left to the liveness sweeper's normal dead-node requeue
    /// path rather than requeued synchronously here.
    pub fn deregister_node(&self, node_id: NodeId) {
        self.registry.deregister(node_id);
        self.scheduler_handle.wake_now();
    }
}
