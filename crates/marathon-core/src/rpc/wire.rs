//! The worker wire protocol: length-prefixed framed messages.
//!
//! Each frame is `[4B header-len | header | 4B body-len | body]`, header and
//! body each `serde_json`, lengths big-endian `u32`. Implemented as a
//! `tokio_util::codec::{Encoder, Decoder}` pair so a `tokio_util::codec::Framed`
//! can drive it over any `AsyncRead + AsyncWrite` -- a TCP stream in
//! production, an in-memory duplex pipe in tests. This follows the
//! length-delimited framing convention `tokio_util` itself documents for
//! `Framed`, built directly on `bytes::{Buf, BufMut, BytesMut}`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;
use uuid::Uuid;

use crate::error::{MarathonError, Result};
use crate::id::{NodeId, TaskId};
use crate::node::{Node, NodeInfo, NodeStatus};
use crate::scheduler::WorkerDispatcher;
use crate::task::Task;

/// Header length above which a frame is rejected without attempting to
/// parse its body.
pub const MAX_HEADER_LEN: usize = 64 * 1024;
/// Body length above which a frame is rejected.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    RegisterNode,
    Heartbeat,
    DispatchTask,
    TaskEvent,
    CancelTask,
    TaskResponse,
    ErrorResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameHeader {
    pub msg_type: MessageType,
    pub correlation_id: Uuid,
}

/// One decoded wire message: a typed header plus an opaque JSON body the
/// caller deserializes according to `header.msg_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: serde_json::Value,
}

impl Frame {
    pub fn new(msg_type: MessageType, body: impl Serialize) -> Self {
        Self {
            header: FrameHeader { msg_type, correlation_id: Uuid::new_v4() },
            body: serde_json::to_value(body).unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchTaskBody {
    pub task: Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTaskBody {
    pub task_id: TaskId,
}

/// Errors from encoding/decoding a frame. Carries enough detail for the
/// façade to surface oversized or truncated frames as `InvalidArgument`
/// before the body is ever parsed.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame section of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl From<WireError> for MarathonError {
    fn from(err: WireError) -> Self {
        MarathonError::InvalidArgument(err.to_string())
    }
}

/// The length-prefixed header/body codec.
#[derive(Debug, Default)]
pub struct WireCodec;

impl Encoder<Frame> for WireCodec {
    type Error = WireError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let header_bytes = serde_json::to_vec(&frame.header)
            .map_err(|e| WireError::Malformed(format!("header serialize: {e}")))?;
        let body_bytes = serde_json::to_vec(&frame.body)
            .map_err(|e| WireError::Malformed(format!("body serialize: {e}")))?;

        if header_bytes.len() > MAX_HEADER_LEN {
            return Err(WireError::FrameTooLarge(header_bytes.len(), MAX_HEADER_LEN));
        }
        if body_bytes.len() > MAX_BODY_LEN {
            return Err(WireError::FrameTooLarge(body_bytes.len(), MAX_BODY_LEN));
        }

        dst.reserve(8 + header_bytes.len() + body_bytes.len());
        dst.put_u32(header_bytes.len() as u32);
        dst.put_slice(&header_bytes);
        dst.put_u32(body_bytes.len() as u32);
        dst.put_slice(&body_bytes);
        Ok(())
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Frame>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let header_len = u32::from_be_bytes(src[0..4].try_into().expect("slice is 4 bytes")) as usize;
        if header_len > MAX_HEADER_LEN {
            return Err(WireError::FrameTooLarge(header_len, MAX_HEADER_LEN));
        }

        if src.len() < 4 + header_len + 4 {
            return Ok(None);
        }
        let body_len_offset = 4 + header_len;
        let body_len = u32::from_be_bytes(
            src[body_len_offset..body_len_offset + 4].try_into().expect("slice is 4 bytes"),
        ) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(WireError::FrameTooLarge(body_len, MAX_BODY_LEN));
        }

        let total_len = 4 + header_len + 4 + body_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut frame_bytes = src.split_to(total_len);
        frame_bytes.advance(4);
        let header_bytes = frame_bytes.split_to(header_len);
        frame_bytes.advance(4);
        let body_bytes = frame_bytes;

        let header: FrameHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| WireError::Malformed(format!("header parse: {e}")))?;
        let body: serde_json::Value = serde_json::from_slice(&body_bytes)
            .map_err(|e| WireError::Malformed(format!("body parse: {e}")))?;

        Ok(Some(Frame { header, body }))
    }
}

/// Tracks the live outbound half of each node's wire connection, keyed by
/// `NodeId`. The orchestrator's TCP accept loop attaches a connection here
/// once a `RegisterNode` frame has been processed by the façade; this is
/// the concrete `WorkerDispatcher` the scheduler dispatches through in
/// production.
#[derive(Default)]
pub struct NodeConnections {
    senders: Mutex<HashMap<NodeId, mpsc::UnboundedSender<Frame>>>,
}

impl NodeConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, node_id: NodeId, sender: mpsc::UnboundedSender<Frame>) {
        self.senders.lock().expect("connections lock poisoned").insert(node_id, sender);
    }

    pub fn detach(&self, node_id: NodeId) {
        self.senders.lock().expect("connections lock poisoned").remove(&node_id);
    }

    fn send(&self, node_id: NodeId, frame: Frame) -> Result<()> {
        let senders = self.senders.lock().expect("connections lock poisoned");
        let sender = senders
            .get(&node_id)
            .ok_or_else(|| MarathonError::DispatchFailed(format!("no live connection to node {node_id}")))?;
        sender
            .send(frame)
            .map_err(|_| MarathonError::DispatchFailed(format!("connection to node {node_id} closed")))
    }
}

#[async_trait]
impl WorkerDispatcher for NodeConnections {
    async fn dispatch_task(&self, node: &Node, task: &Task) -> Result<()> {
        self.send(node.id, Frame::new(MessageType::DispatchTask, DispatchTaskBody { task: task.clone() }))
    }

    async fn send_cancel(&self, node: &Node, task_id: TaskId) -> Result<()> {
        self.send(node.id, Frame::new(MessageType::CancelTask, CancelTaskBody { task_id }))
    }
}

/// Information carried by an inbound `RegisterNode` frame body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeBody {
    pub info: NodeInfo,
    pub auth_key: String,
}

/// Information carried by an inbound `Heartbeat` frame body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatBody {
    pub node_id: NodeId,
    pub status: Option<NodeStatus>,
}

pub(crate) fn log_oversized_frame(len: usize, limit: usize) {
    warn!(len, limit, "rejected oversized wire frame before parsing its body");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().expect("complete frame")
    }

    #[test]
    fn encode_decode_roundtrip() {
        let frame = Frame::new(MessageType::Heartbeat, HeartbeatBody { node_id: NodeId::new(), status: None });
        let decoded = roundtrip(frame.clone());
        assert_eq!(decoded.header.msg_type, MessageType::Heartbeat);
        assert_eq!(decoded.body, frame.body);
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let mut codec = WireCodec;
        let frame = Frame::new(MessageType::CancelTask, CancelTaskBody { task_id: TaskId::new() });
        let mut full = BytesMut::new();
        codec.encode(frame, &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_oversized_header_before_parsing() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_HEADER_LEN + 1) as u32);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge(_, _)));
    }

    #[test]
    fn two_frames_back_to_back_both_decode() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(MessageType::Heartbeat, HeartbeatBody { node_id: NodeId::new(), status: None }), &mut buf).unwrap();
        codec.encode(Frame::new(MessageType::CancelTask, CancelTaskBody { task_id: TaskId::new() }), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.header.msg_type, MessageType::Heartbeat);
        assert_eq!(second.header.msg_type, MessageType::CancelTask);
    }

    #[tokio::test]
    async fn node_connections_dispatch_roundtrips_task() {
        let connections = NodeConnections::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let node = Node::new(NodeId::new(), NodeInfo { address: "n1".into(), capabilities: Default::default(), capacity: 1 });
        connections.attach(node.id, tx);

        let task = crate::task::Task::new(TaskId::new(), Uuid::new_v4(), crate::task::TaskPayload::default());
        connections.dispatch_task(&node, &task).await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.header.msg_type, MessageType::DispatchTask);
    }

    #[tokio::test]
    async fn dispatch_to_unknown_node_fails() {
        let connections = NodeConnections::new();
        let node = Node::new(NodeId::new(), NodeInfo { address: "n1".into(), capabilities: Default::default(), capacity: 1 });
        let task = crate::task::Task::new(TaskId::new(), Uuid::new_v4(), crate::task::TaskPayload::default());
        let err = connections.dispatch_task(&node, &task).await.unwrap_err();
        assert!(matches!(err, MarathonError::DispatchFailed(_)));
    }
}
