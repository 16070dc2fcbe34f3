//! The TCP accept loop for the worker wire protocol.
//!
//! One task per connection: a register/heartbeat/event reader loop against
//! the façade, and a forwarder draining the per-node outbound queue
//! `NodeConnections` hands the scheduler a [`WorkerDispatcher`] handle for.
//! Shutdown is cooperative: a `CancellationToken` is threaded through the
//! accept loop and every connection handler so the listener and its
//! connections all unwind on the same signal.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::SinkExt;
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use marathon_core::id::NodeId;
use marathon_core::rpc::auth::NodeAuth;
use marathon_core::rpc::wire::{Frame, FrameHeader, HeartbeatBody, MessageType, NodeConnections, RegisterNodeBody, WireCodec};
use marathon_core::rpc::{Caller, HeartbeatRequest, RegisterNodeRequest, ReportEventRequest, ReportUsageRequest, RpcFacade};

pub async fn run(
    bind: SocketAddr,
    facade: Arc<RpcFacade>,
    connections: Arc<NodeConnections>,
    node_auth: Arc<NodeAuth>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(%bind, "worker wire listener started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("worker wire listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept worker connection");
                        continue;
                    }
                };
                tokio::spawn(handle_connection(
                    stream,
                    peer,
                    Arc::clone(&facade),
                    Arc::clone(&connections),
                    Arc::clone(&node_auth),
                    cancel.child_token(),
                ));
            }
        }
    }
}

#[instrument(skip(stream, facade, connections, node_auth, cancel), fields(%peer))]
async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    facade: Arc<RpcFacade>,
    connections: Arc<NodeConnections>,
    node_auth: Arc<NodeAuth>,
    cancel: CancellationToken,
) {
    let framed = Framed::new(stream, WireCodec);
    let (mut sink, mut stream) = futures::StreamExt::split(framed);
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<Frame>();

    let mut node_id: Option<NodeId> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                let frame = match incoming {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        warn!(error = %e, "malformed frame from worker connection");
                        break;
                    }
                    None => break,
                };

                match frame.header.msg_type {
                    MessageType::RegisterNode => {
                        let Ok(body) = serde_json::from_value::<RegisterNodeBody>(frame.body) else {
                            warn!("malformed RegisterNode body");
                            continue;
                        };
                        if node_auth.verify(&body.auth_key).is_err() {
                            warn!("worker presented an invalid auth key, closing connection");
                            break;
                        }
                        match facade.register_node(Caller::Worker, RegisterNodeRequest { info: body.info }).await {
                            Ok(id) => {
                                node_id = Some(id);
                                connections.attach(id, outbound_tx.clone());
                                info!(node_id = %id, "worker registered");
                                let response = Frame {
                                    header: FrameHeader { msg_type: MessageType::TaskResponse, correlation_id: frame.header.correlation_id },
                                    body: serde_json::json!({ "node_id": id.to_string() }),
                                };
                                let _ = outbound_tx.send(response);
                            }
                            Err(e) => warn!(error = %e, "register_node failed"),
                        }
                    }
                    MessageType::Heartbeat => {
                        let Ok(body) = serde_json::from_value::<HeartbeatBody>(frame.body) else {
                            warn!("malformed Heartbeat body");
                            continue;
                        };
                        if let Err(e) = facade
                            .heartbeat(Caller::Worker, HeartbeatRequest { node_id: body.node_id, status: body.status })
                            .await
                        {
                            warn!(error = %e, "heartbeat failed");
                        }
                    }
                    MessageType::TaskEvent => {
                        if let Ok(req) = serde_json::from_value::<ReportEventRequest>(frame.body.clone()) {
                            if let Err(e) = facade.report_event(Caller::Worker, req).await {
                                warn!(error = %e, "report_event failed");
                            }
                        } else if let Ok(req) = serde_json::from_value::<ReportUsageRequest>(frame.body) {
                            if let Err(e) = facade.report_usage(Caller::Worker, req).await {
                                warn!(error = %e, "report_usage failed");
                            }
                        } else {
                            warn!("malformed TaskEvent body");
                        }
                    }
                    other => {
                        warn!(?other, "unexpected message type from worker connection");
                    }
                }
            }
        }
    }

    if let Some(id) = node_id {
        connections.detach(id);
        facade.deregister_node(id);
        info!(node_id = %id, "worker connection closed, node deregistered");
    }
}
