//! Async driver for a [`Node`]
//!
//! The node itself never awaits. The driver owns it on a single task and
//! multiplexes three sources: link events, commands from [`NodeHandle`]s
//! and the scheduler's next deadline. After every step the outbox is
//! flushed to the link.
//!
//! ```text
//!  NodeHandle ──mpsc──┐
//!  LinkEvent  ──mpsc──┼──► select! ──► Node ──► outbox ──► LinkTransport
//!  sleep_until ───────┘
//! ```

use crate::actor::Actor;
use crate::completion::Completion;
use crate::connection::PeerPort;
use crate::error::{Result, RuntimeError};
use crate::node::{Node, NodeStats};
use crate::queue::QueueConfig;
use flow_codec::encode_frame;
use flow_network::{LinkEvent, LinkTransport, OutboundAction};
use flow_types::{ActorId, Disconnect, NodeId, PortId, PortProperties, Response};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const COMMAND_CAPACITY: usize = 64;

/// Requests from outside the driver task
pub enum NodeCommand {
    AddActor(Box<dyn Actor>),
    AddPort {
        actor: ActorId,
        name: String,
        properties: PortProperties,
        reply: oneshot::Sender<PortId>,
    },
    SetPortConfig {
        port_id: PortId,
        config: QueueConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    Connect {
        port_id: PortId,
        peer: PeerPort,
        completion: Completion,
    },
    Disconnect {
        port_id: PortId,
        terminate: Disconnect,
        completion: Completion,
    },
    Quiesce {
        timeout: Duration,
        completion: Completion,
    },
    PortState {
        port_id: PortId,
        reply: oneshot::Sender<Result<Value>>,
    },
    Stats {
        reply: oneshot::Sender<NodeStats>,
    },
    Shutdown,
}

impl NodeCommand {
    fn name(&self) -> &'static str {
        match self {
            NodeCommand::AddActor(_) => "add_actor",
            NodeCommand::AddPort { .. } => "add_port",
            NodeCommand::SetPortConfig { .. } => "set_port_config",
            NodeCommand::Connect { .. } => "connect",
            NodeCommand::Disconnect { .. } => "disconnect",
            NodeCommand::Quiesce { .. } => "quiesce",
            NodeCommand::PortState { .. } => "port_state",
            NodeCommand::Stats { .. } => "stats",
            NodeCommand::Shutdown => "shutdown",
        }
    }
}

/// Cloneable handle to a running node
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: NodeId,
    tx: mpsc::Sender<NodeCommand>,
}

impl NodeHandle {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    async fn submit(&self, command: NodeCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| RuntimeError::stopped(format!("node {} is not running", self.id)))
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> NodeCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.submit(build(tx)).await?;
        rx.await
            .map_err(|_| RuntimeError::stopped(format!("node {} dropped the request", self.id)))
    }

    async fn complete(&self, operation: &'static str, build: impl FnOnce(Completion) -> NodeCommand) -> Result<Response> {
        let (completion, rx) = Completion::channel(operation);
        self.submit(build(completion)).await?;
        rx.await
            .map_err(|_| RuntimeError::stopped(format!("node {} dropped {}", self.id, operation)))
    }

    pub async fn add_actor(&self, actor: Box<dyn Actor>) -> Result<()> {
        self.submit(NodeCommand::AddActor(actor)).await
    }

    pub async fn add_port(&self, actor: &ActorId, name: &str, properties: PortProperties) -> Result<PortId> {
        let (actor, name) = (actor.clone(), name.to_string());
        self.request(|reply| NodeCommand::AddPort {
            actor,
            name,
            properties,
            reply,
        })
        .await
    }

    pub async fn set_port_config(&self, port_id: &PortId, config: QueueConfig) -> Result<()> {
        let port_id = port_id.clone();
        self.request(|reply| NodeCommand::SetPortConfig { port_id, config, reply })
            .await?
    }

    /// Connect `port_id` to `peer`; the response carries the final status
    pub async fn connect(&self, port_id: &PortId, peer: PeerPort) -> Result<Response> {
        let port_id = port_id.clone();
        self.complete("connect", |completion| NodeCommand::Connect {
            port_id,
            peer,
            completion,
        })
        .await
    }

    pub async fn disconnect(&self, port_id: &PortId, terminate: Disconnect) -> Result<Response> {
        let port_id = port_id.clone();
        self.complete("disconnect", |completion| NodeCommand::Disconnect {
            port_id,
            terminate,
            completion,
        })
        .await
    }

    pub async fn quiesce(&self, timeout: Duration) -> Result<Response> {
        self.complete("quiesce", |completion| NodeCommand::Quiesce { timeout, completion })
            .await
    }

    pub async fn port_state(&self, port_id: &PortId) -> Result<Value> {
        let port_id = port_id.clone();
        self.request(|reply| NodeCommand::PortState { port_id, reply }).await?
    }

    pub async fn stats(&self) -> Result<NodeStats> {
        self.request(|reply| NodeCommand::Stats { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.submit(NodeCommand::Shutdown).await
    }
}

pub struct NodeDriver<L: LinkTransport> {
    node: Node,
    link: L,
    inbox: mpsc::Receiver<LinkEvent>,
    commands: mpsc::Receiver<NodeCommand>,
}

impl<L: LinkTransport> NodeDriver<L> {
    pub fn new(node: Node, link: L, inbox: mpsc::Receiver<LinkEvent>) -> (Self, NodeHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let handle = NodeHandle {
            id: node.id().clone(),
            tx,
        };
        let driver = Self {
            node,
            link,
            inbox,
            commands,
        };
        (driver, handle)
    }

    /// Run until shutdown or until every handle and the inbox are gone
    pub async fn run(mut self) -> Node {
        info!(node = %self.node.id(), "Node driver started");
        self.node.start(Instant::now());

        loop {
            self.flush().await;

            let deadline = self.node.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = self.inbox.recv() => match event {
                    Some(event) => self.node.handle_link_event(event, Instant::now()),
                    None => {
                        info!(node = %self.node.id(), "Link inbox closed");
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                _ = timer => self.node.on_timer(Instant::now()),
            }
        }

        self.flush().await;
        info!(node = %self.node.id(), "Node driver stopped");
        self.node
    }

    fn handle_command(&mut self, command: NodeCommand) {
        debug!(node = %self.node.id(), command = command.name(), "Command");
        let now = Instant::now();
        match command {
            NodeCommand::AddActor(actor) => self.node.add_actor(actor, now),
            NodeCommand::AddPort {
                actor,
                name,
                properties,
                reply,
            } => {
                let _ = reply.send(self.node.add_port(&actor, &name, properties));
            }
            NodeCommand::SetPortConfig { port_id, config, reply } => {
                let _ = reply.send(self.node.set_port_config(&port_id, &config));
            }
            NodeCommand::Connect {
                port_id,
                peer,
                completion,
            } => self.node.connect(&port_id, peer, completion, now),
            NodeCommand::Disconnect {
                port_id,
                terminate,
                completion,
            } => self.node.disconnect(&port_id, terminate, completion, now),
            NodeCommand::Quiesce { timeout, completion } => self.node.quiesce(timeout, completion, now),
            NodeCommand::PortState { port_id, reply } => {
                let _ = reply.send(self.node.port_state(&port_id));
            }
            NodeCommand::Stats { reply } => {
                let _ = reply.send(self.node.stats());
            }
            NodeCommand::Shutdown => {}
        }
    }

    /// Push everything the node queued to the link. A failed send is
    /// reported back to the node as a lost link.
    async fn flush(&mut self) {
        loop {
            let actions = self.node.drain_outbox();
            if actions.is_empty() {
                return;
            }
            for action in actions {
                match action {
                    OutboundAction::Send(envelope) => {
                        let peer = envelope.to_rt_uuid.clone();
                        let frame = match encode_frame(&envelope) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(peer = %peer, cmd = envelope.cmd_name(), error = %e, "Could not encode envelope");
                                continue;
                            }
                        };
                        if let Err(e) = self.link.send(&peer, frame).await {
                            debug!(peer = %peer, cmd = envelope.cmd_name(), error = %e, "Send failed");
                            self.node.link_lost(&peer, Instant::now());
                        }
                    }
                    OutboundAction::RequestLink(peer) => {
                        if let Err(e) = self.link.request_link(&peer).await {
                            warn!(peer = %peer, error = %e, "Link request failed");
                            self.node.link_lost(&peer, Instant::now());
                        }
                    }
                }
            }
        }
    }
}
